//! Tests for diffusion-engine: reducer, breaker, translator, batcher, pipeline, config

use diffusion_core::*;
use diffusion_engine::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn obj(v: Value) -> PanelData {
    v.as_object().cloned().unwrap()
}

fn panel(id: &str, kind: &str, data: Value) -> Value {
    json!({"id": id, "type": kind, "data": data, "timestamp": 1000})
}

fn add(id: &str, kind: &str, data: Value) -> PatchOperation {
    PatchOperation::add("/panels/-", panel(id, kind, data))
}

fn reducer() -> PatchReducer {
    PatchReducer::new(Arc::new(Registry::default()))
}

fn translator() -> IntentTranslator {
    IntentTranslator::new(Arc::new(Registry::default()))
}

fn pipeline(context: &str) -> Pipeline {
    Pipeline::from_config(&DiffusionConfig::default(), context, RunMode::Stable)
}

fn map_data() -> PanelData {
    obj(json!({"center": {"lat": 51.5, "lng": -0.12}}))
}

fn doc(doc_id: &str) -> Intent {
    Intent::show_panel("doc_viewer", obj(json!({ "doc_id": doc_id })))
}

fn state_with(context: &str, panels: Vec<Panel>) -> DashboardState {
    let mut state = DashboardState::new(context);
    state.panels = panels;
    state
}

fn map_panel(id: &str) -> Panel {
    Panel::new(id, "map", map_data(), 1000).with_context("dm")
}

// ===========================================================================
// Reducer: add
// ===========================================================================

#[test]
fn add_to_empty_state_commits_one_panel() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![add("p1", "applicable_policies", json!({"policies": []}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.success);
    assert!(r.is_clean());
    let next = r.new_state.unwrap();
    assert_eq!(next.panels.len(), 1);
    assert_eq!(next.panels[0].id, "p1");
    assert_eq!(next.panels[0].context.as_deref(), Some("dm"));
    assert_eq!(budget.panel_count, 1);
    assert_eq!(budget.total_weight, 2);
    assert!(state.is_empty());
}

#[test]
fn add_outside_allowed_context_is_permission() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![add("pe", "policy_editor", json!({}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    assert!(r.new_state.is_none());
    assert_eq!(r.error.as_ref().unwrap().category, ErrorCategory::Permission);
    assert_eq!(budget, BudgetTracker::new());
}

#[test]
fn hard_error_discards_earlier_ops() {
    let state = DashboardState::new("dm");
    let before = serde_json::to_string(&state).unwrap();
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![
        add("k1", "key_issues_matrix", json!({"issues": []})),
        add("k2", "key_issues_matrix", json!({"issues": []})),
    ]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    let err = r.error.unwrap();
    assert_eq!(err.category, ErrorCategory::Budget);
    assert_eq!(err.op_index, Some(1));
    assert_eq!(serde_json::to_string(&state).unwrap(), before);
    assert_eq!(budget, BudgetTracker::new());
}

#[test]
fn soft_error_skips_only_the_bad_op() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![
        PatchOperation::add("/foo/0", panel("x", "map", json!({}))),
        add("p1", "applicable_policies", json!({"policies": []})),
    ]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.success);
    assert_eq!(r.applied, 1);
    assert_eq!(r.rejected_ops.len(), 1);
    assert_eq!(r.rejected_ops[0].index, 0);
    assert_eq!(r.rejected_ops[0].error.category, ErrorCategory::Validation);
    let next = r.new_state.unwrap();
    assert_eq!(next.panel_ids(), vec!["p1"]);
    assert_eq!(next.error_count, 1);
}

#[test]
fn all_ops_soft_rejected_is_a_failure() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::add("/foo/0", panel("x", "map", json!({})))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    assert_eq!(r.count(ErrorCategory::Validation), 1);
}

#[test]
fn duplicate_id_is_rejected() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![add("m", "map", json!({"center": {"lat": 1.0, "lng": 1.0}}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    assert!(r.error.unwrap().message.contains("duplicate"));
}

#[test]
fn add_with_invalid_data_is_validation() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![add("m", "map", json!({"center": {"lat": 200.0, "lng": 0.0}}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert_eq!(r.error.unwrap().category, ErrorCategory::Validation);
}

#[test]
fn add_at_explicit_index_inserts() {
    let state = state_with("dm", vec![map_panel("a"), map_panel("b")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::add(
        "/panels/1",
        panel("d", "doc_viewer", json!({"doc_id": "LP"})),
    )]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Deep);

    assert_eq!(r.new_state.unwrap().panel_ids(), vec!["a", "d", "b"]);
}

#[test]
fn oversized_and_empty_envelopes() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();

    let big = PatchEnvelope::new((0..21).map(|i| PatchOperation::remove(format!("/panels/{}", i))).collect());
    let r = reducer().apply_patch(&state, &big, &mut budget, RunMode::Stable);
    assert_eq!(r.error.unwrap().category, ErrorCategory::Validation);

    let empty = PatchEnvelope::new(Vec::new());
    let r = reducer().apply_patch(&state, &empty, &mut budget, RunMode::Stable);
    assert!(!r.success);
    assert!(r.new_state.is_none());
    assert_eq!(r.error.unwrap().category, ErrorCategory::Validation);
}

#[test]
fn empty_raw_envelope_counts_as_a_failure() {
    let mut p = pipeline("dm");
    let out = p.apply_envelope(PatchEnvelope::new(Vec::new()));

    assert!(matches!(out[0], Dispatch::Rejected { .. }));
    assert_eq!(p.breaker().stats().validation_errors, 1);
    assert_eq!(p.breaker().stats().total_failures, 1);
    assert!(p.state().is_empty());
}

// ===========================================================================
// Reducer: replace / remove / test
// ===========================================================================

#[test]
fn replace_data_by_id_charges_an_update() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::replace(
        "/panels/m/data",
        json!({"center": {"lat": 52.0, "lng": 0.5}}),
    )]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.success);
    let next = r.new_state.unwrap();
    assert_eq!(next.panels[0].data["center"]["lat"], 52.0);
    assert_eq!(budget.update_count, 1);
}

#[test]
fn positional_index_still_resolves() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::replace("/panels/0/timestamp", json!(2000))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert_eq!(r.new_state.unwrap().panels[0].timestamp, 2000);
}

#[test]
fn numeric_ids_are_addressed_by_id_not_position() {
    let state = state_with(
        "dm",
        vec![
            Panel::new("first", "doc_viewer", obj(json!({"doc_id": "a"})), 1000),
            Panel::new("0", "doc_viewer", obj(json!({"doc_id": "b"})), 1000),
        ],
    );
    let mut ctx = TranslationContext::from_state(&state, 2000);
    let tr = translator();
    let mut budget = BudgetTracker::new();

    let t = tr.translate(&Intent::update_panel("0", obj(json!({"doc_id": "UPDATED"}))), &mut ctx);
    let r = reducer().apply_patch(&state, &PatchEnvelope::new(t.ops), &mut budget, RunMode::Stable);
    let next = r.new_state.unwrap();
    assert_eq!(next.find("first").unwrap().data["doc_id"], "a");
    assert_eq!(next.find("0").unwrap().data["doc_id"], "UPDATED");

    let t = tr.translate(&Intent::remove_panel("0"), &mut ctx);
    let r = reducer().apply_patch(&next, &PatchEnvelope::new(t.ops), &mut budget, RunMode::Stable);
    assert_eq!(r.new_state.unwrap().panel_ids(), vec!["first"]);
}

#[test]
fn replace_on_read_only_kind_is_soft() {
    let graph = Panel::new("dependency_graph", "dependency_graph", PanelData::new(), 1000);
    let state = state_with("evidence", vec![graph]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::replace("/panels/dependency_graph/data", json!({}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    assert_eq!(r.error.unwrap().category, ErrorCategory::Validation);
    assert_eq!(budget.update_count, 0);
}

#[test]
fn identity_fields_are_immutable() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    for path in ["/panels/m/id", "/panels/m/type"] {
        let env = PatchEnvelope::new(vec![PatchOperation::replace(path, json!("x"))]);
        let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);
        assert_eq!(r.error.unwrap().category, ErrorCategory::Validation, "{}", path);
    }
}

#[test]
fn whole_panel_replace_cannot_change_type() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![PatchOperation::replace(
        "/panels/m",
        panel("m", "doc_viewer", json!({"doc_id": "x"})),
    )]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.error.unwrap().message.contains("immutable"));
}

#[test]
fn remove_does_not_refund_budget() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![
        add("m", "map", json!({"center": {"lat": 1.0, "lng": 1.0}})),
        PatchOperation::remove("/panels/m"),
    ]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.new_state.unwrap().is_empty());
    assert_eq!(budget.panel_count, 1);
    assert_eq!(budget.total_weight, 3);
}

#[test]
fn remove_missing_panel_is_not_found() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();
    let env = PatchEnvelope::new(vec![
        PatchOperation::remove("/panels/nope"),
        PatchOperation::remove("/panels/m"),
    ]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(r.success);
    assert_eq!(r.count(ErrorCategory::NotFound), 1);
    assert!(r.new_state.unwrap().is_empty());
}

#[test]
fn test_op_guards_following_ops() {
    let state = state_with("dm", vec![map_panel("m")]);
    let mut budget = BudgetTracker::new();

    let failing = PatchEnvelope::new(vec![PatchOperation::test("/panels/m/type", json!("doc_viewer"))]);
    let r = reducer().apply_patch(&state, &failing, &mut budget, RunMode::Stable);
    assert_eq!(r.error.unwrap().category, ErrorCategory::Validation);

    let passing = PatchEnvelope::new(vec![
        PatchOperation::test("/panels/m/data/center", json!({"lat": 51.5, "lng": -0.12})),
        PatchOperation::remove("/panels/m"),
    ]);
    let r = reducer().apply_patch(&state, &passing, &mut budget, RunMode::Stable);
    assert_eq!(r.applied, 2);
}

// ===========================================================================
// Budget
// ===========================================================================

#[test]
fn budget_ceiling_rejects_sixth_panel_and_counts_once() {
    let mut p = pipeline("dm");
    let first = PatchEnvelope::new(vec![
        add("d1", "doc_viewer", json!({"doc_id": "a"})),
        add("d2", "doc_viewer", json!({"doc_id": "b"})),
        add("d3", "doc_viewer", json!({"doc_id": "c"})),
        add("d4", "doc_viewer", json!({"doc_id": "d"})),
        add("ap", "applicable_policies", json!({"policies": []})),
    ]);
    let out = p.apply_envelope(first);
    assert!(matches!(out[0], Dispatch::Committed { applied: 5, .. }));

    let out = p.apply_envelope(PatchEnvelope::new(vec![add(
        "m1",
        "map",
        json!({"center": {"lat": 1.0, "lng": 2.0}}),
    )]));
    match &out[0] {
        Dispatch::Rejected { error, .. } => assert_eq!(error.category, ErrorCategory::Budget),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(p.breaker().stats().budget_violations, 1);
    assert_eq!(p.state().len(), 5);
    assert!(!p.breaker().is_broken());
}

#[test]
fn deep_mode_has_higher_ceilings() {
    let reg = Registry::default();
    let tracker = BudgetTracker {
        panel_count: 6,
        total_weight: 13,
        ..BudgetTracker::new()
    };
    assert_eq!(reg.check_budget(&tracker, RunMode::Stable).unwrap_err().category, ErrorCategory::Budget);
    assert!(reg.check_budget(&tracker, RunMode::Deep).is_ok());
}

#[test]
fn weight_ceiling_rejects_add_under_panel_limit() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker {
        panel_count: 1,
        total_weight: 10,
        ..BudgetTracker::new()
    };
    let before = budget.clone();
    let env = PatchEnvelope::new(vec![add("m", "map", json!({"center": {"lat": 1.0, "lng": 2.0}}))]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    let err = r.error.unwrap();
    assert_eq!(err.category, ErrorCategory::Budget);
    assert!(err.message.contains("weight"), "{}", err.message);
    assert_eq!(budget, before);
}

#[test]
fn update_ceiling_aborts_whole_envelope() {
    let state = state_with("dm", vec![map_panel("m")]);
    let before = serde_json::to_string(&state).unwrap();
    let mut budget = BudgetTracker {
        panel_count: 1,
        total_weight: 3,
        update_count: 19,
        ..BudgetTracker::new()
    };
    let env = PatchEnvelope::new(vec![
        PatchOperation::replace("/panels/m/data", json!({"center": {"lat": 52.0, "lng": 0.5}})),
        PatchOperation::replace("/panels/m/data", json!({"center": {"lat": 53.0, "lng": 0.5}})),
    ]);

    let r = reducer().apply_patch(&state, &env, &mut budget, RunMode::Stable);

    assert!(!r.success);
    assert!(r.new_state.is_none());
    let err = r.error.clone().unwrap();
    assert_eq!(err.category, ErrorCategory::Budget);
    assert_eq!(err.op_index, Some(1));
    assert!(err.message.contains("update"), "{}", err.message);
    assert_eq!(budget.update_count, 19);
    assert_eq!(serde_json::to_string(&state).unwrap(), before);

    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    breaker.record_patch_result_at(&r, env.len(), 1);
    assert_eq!(breaker.stats().budget_violations, 1);
}

// ===========================================================================
// Circuit breaker
// ===========================================================================

fn bad_path_envelope() -> PatchEnvelope {
    PatchEnvelope::new(vec![PatchOperation::add("/foo/0", panel("x", "map", json!({})))])
}

#[test]
fn two_consecutive_validation_failures_trip() {
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());

    let r = reducer().apply_patch(&state, &bad_path_envelope(), &mut budget, RunMode::Stable);
    breaker.record_patch_result_at(&r, 1, 1000);
    assert!(!breaker.is_broken());
    assert_eq!(breaker.status().status, BreakerStatus::Degraded);
    assert!(breaker.status().healthy);

    let r = reducer().apply_patch(&state, &bad_path_envelope(), &mut budget, RunMode::Stable);
    breaker.record_patch_result_at(&r, 1, 1001);
    assert_eq!(breaker.stats().consecutive_validation_failures, 2);
    assert!(breaker.is_broken());
    assert!(!breaker.should_allow_operation());
    assert!(breaker.break_reason().unwrap().contains("consecutive validation"));
}

#[test]
fn clean_success_resets_consecutive_counter() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    breaker.record_errors_at(&[ApplyError::validation("bad")], 1);
    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let ok = PatchEnvelope::new(vec![add("p1", "applicable_policies", json!({"policies": []}))]);
    let r = reducer().apply_patch(&state, &ok, &mut budget, RunMode::Stable);
    breaker.record_patch_result_at(&r, 1, 2);

    assert_eq!(breaker.stats().consecutive_validation_failures, 0);
    assert_eq!(breaker.stats().total_failures, 1);
}

#[test]
fn single_unknown_error_trips() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    breaker.record_errors_at(&[ApplyError::unknown("boom")], 5);
    assert!(breaker.is_broken());
    assert_eq!(breaker.stats().broken_at, Some(5));
}

#[test]
fn permission_and_budget_thresholds() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    breaker.record_errors_at(&[ApplyError::permission("no")], 1);
    assert!(!breaker.is_broken());
    breaker.record_errors_at(&[ApplyError::permission("no")], 2);
    assert!(breaker.break_reason().unwrap().contains("permission"));

    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    for t in 0..2 {
        breaker.record_errors_at(&[ApplyError::budget("full")], t);
    }
    assert!(!breaker.is_broken());
    breaker.record_errors_at(&[ApplyError::budget("full")], 3);
    assert!(breaker.break_reason().unwrap().contains("budget"));
}

#[test]
fn total_failures_threshold() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    for t in 0..4 {
        breaker.record_errors_at(&[ApplyError::not_found("gone")], t);
    }
    assert!(!breaker.is_broken());
    breaker.record_errors_at(&[ApplyError::not_found("gone")], 4);
    assert!(breaker.break_reason().unwrap().contains("total"));
}

#[test]
fn runaway_success_trips_rate_limit() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    let ok = PatchResult {
        success: true,
        new_state: None,
        error: None,
        errors: Vec::new(),
        rejected_ops: Vec::new(),
        applied: 60,
    };
    breaker.record_patch_result_at(&ok, 60, 0);
    breaker.record_patch_result_at(&ok, 60, 10_000);
    assert!(!breaker.is_broken(), "first window should have expired");
    breaker.record_patch_result_at(&ok, 60, 11_000);
    assert!(breaker.break_reason().unwrap().contains("rate limit"));
}

#[test]
fn trip_is_monotonic_until_reset() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    breaker.record_errors_at(&[ApplyError::unknown("boom")], 1);
    let first_reason = breaker.break_reason().unwrap().to_string();

    let state = DashboardState::new("dm");
    let mut budget = BudgetTracker::new();
    let ok = PatchEnvelope::new(vec![add("p1", "applicable_policies", json!({"policies": []}))]);
    let r = reducer().apply_patch(&state, &ok, &mut budget, RunMode::Stable);
    for t in 2..10 {
        breaker.record_patch_result_at(&r, 1, t);
    }
    breaker.record_errors_at(&[ApplyError::permission("x"), ApplyError::permission("y")], 11);

    assert!(breaker.is_broken());
    assert_eq!(breaker.break_reason().unwrap(), first_reason);

    breaker.reset();
    assert!(!breaker.is_broken());
    assert_eq!(breaker.status().status, BreakerStatus::Healthy);
}

#[test]
fn history_is_capped() {
    let config = BreakerConfig {
        history_capacity: 3,
        ..BreakerConfig::default()
    };
    let mut breaker = CircuitBreaker::new(config);
    let errors: Vec<_> = (0..5).map(|i| ApplyError::not_found(format!("e{}", i))).collect();
    breaker.record_errors_at(&errors, 1);

    let kept: Vec<_> = breaker.history().map(|r| r.message.clone()).collect();
    assert_eq!(kept, vec!["e2", "e3", "e4"]);
    assert_eq!(breaker.error_count(), 5);
}

// ===========================================================================
// Safe mode
// ===========================================================================

#[test]
fn safe_mode_prepends_notice_and_keeps_panels() {
    let state = state_with("dm", vec![map_panel("m")]);
    let next = enter_safe_mode(&state, "2 consecutive validation failures", 2, 1234);

    assert!(next.safe_mode);
    assert_eq!(next.panel_ids(), vec![SAFE_MODE_PANEL, "m"]);
    assert_eq!(next.panels[0].data["reason"], "2 consecutive validation failures");
    assert_eq!(next.panels[0].data["errorCount"], 2);
    assert_eq!(next.error_count, 2);
    assert!(validate_state(&next, &Registry::default()).is_ok());

    let again = enter_safe_mode(&next, "other", 9, 9999);
    assert_eq!(again, next);
}

// ===========================================================================
// Translator
// ===========================================================================

#[test]
fn show_panel_becomes_add_with_content_id() {
    let mut ctx = TranslationContext::new("dm", 1000);
    let t = translator().translate(&doc("LP_2024"), &mut ctx);

    assert!(t.errors.is_empty());
    assert_eq!(t.ops.len(), 1);
    assert_eq!(t.ops[0].op, PatchOp::Add);
    assert_eq!(t.ops[0].path, "/panels/-");
    let value = t.ops[0].value.as_ref().unwrap();
    assert_eq!(value["id"], "doc_viewer_d792d7e6");
    assert_eq!(value["timestamp"], 1000);
    assert_eq!(value["context"], "dm");
    assert!(ctx.is_known("doc_viewer_d792d7e6"));
}

#[test]
fn repeated_show_panel_becomes_data_replace() {
    let mut ctx = TranslationContext::new("dm", 1000);
    let tr = translator();
    tr.translate(&doc("LP_2024"), &mut ctx);
    let t = tr.translate(&doc("LP_2024"), &mut ctx);

    assert_eq!(t.ops[0].op, PatchOp::Replace);
    assert_eq!(t.ops[0].path, "/panels/doc_viewer_d792d7e6/data");
}

#[test]
fn show_panel_prechecks() {
    let mut ctx = TranslationContext::new("dm", 1000);
    let tr = translator();

    let t = tr.translate(&Intent::show_panel("hologram", PanelData::new()), &mut ctx);
    assert_eq!(t.errors[0].category, ErrorCategory::Validation);

    let t = tr.translate(&Intent::show_panel("policy_editor", PanelData::new()), &mut ctx);
    assert_eq!(t.errors[0].category, ErrorCategory::Permission);
    assert!(t.ops.is_empty());
}

#[test]
fn show_panel_on_read_only_existing_is_skipped() {
    let graph = Panel::new("dependency_graph", "dependency_graph", PanelData::new(), 1000);
    let state = state_with("evidence", vec![graph]);
    let mut ctx = TranslationContext::from_state(&state, 2000);

    let t = translator().translate(&Intent::show_panel("dependency_graph", PanelData::new()), &mut ctx);

    assert!(t.ops.is_empty());
    assert!(t.errors.is_empty());
}

#[test]
fn update_and_remove_target_known_ids() {
    let state = state_with("dm", vec![map_panel("map_1")]);
    let mut ctx = TranslationContext::from_state(&state, 2000);
    let tr = translator();

    let t = tr.translate(&Intent::update_panel("map_1", map_data()), &mut ctx);
    assert_eq!(t.ops[0].path, "/panels/map_1/data");

    let t = tr.translate(&Intent::update_panel("ghost", map_data()), &mut ctx);
    assert_eq!(t.errors[0].category, ErrorCategory::NotFound);

    let t = tr.translate(&Intent::remove_panel("map_1"), &mut ctx);
    assert_eq!(t.ops[0], PatchOperation::remove("/panels/map_1"));
    assert!(!ctx.is_known("map_1"));

    let t = tr.translate(&Intent::remove_panel("map_1"), &mut ctx);
    assert_eq!(t.errors[0].category, ErrorCategory::NotFound);
}

#[test]
fn patch_intent_passes_through_panel_paths_only() {
    let mut ctx = TranslationContext::new("dm", 1000);
    let intent = Intent::patch(vec![
        PatchOperation::remove("/panels/x"),
        PatchOperation::remove("/settings/theme"),
    ]);

    let t = translator().translate(&intent, &mut ctx);

    assert_eq!(t.ops, vec![PatchOperation::remove("/panels/x")]);
    assert_eq!(t.errors.len(), 1);
}

#[test]
fn administrative_intents_produce_nothing() {
    let mut ctx = TranslationContext::new("dm", 1000);
    let tr = translator();

    let t = tr.translate(&Intent::message("thinking"), &mut ctx);
    assert!(t.ops.is_empty() && t.errors.is_empty());

    let blank: Intent = serde_json::from_value(json!({"action": ""})).unwrap();
    let t = tr.translate(&blank, &mut ctx);
    assert_eq!(t.errors[0].category, ErrorCategory::Validation);
}

// ===========================================================================
// Batcher
// ===========================================================================

#[test]
fn intents_within_window_flush_once_in_order() {
    let tr = translator();
    let mut ctx = TranslationContext::new("dm", 1000);
    let mut batcher = IntentBatcher::new(Duration::from_millis(50));
    let t0 = Instant::now();

    batcher.add_intent(doc("a"), t0);
    batcher.add_intent(doc("b"), t0 + Duration::from_millis(3));
    batcher.add_intent(doc("c"), t0 + Duration::from_millis(6));

    assert!(!batcher.is_due(t0 + Duration::from_millis(50)));
    assert!(batcher.is_due(t0 + Duration::from_millis(56)));

    let flush = batcher.flush(&tr, &mut ctx);
    assert_eq!(flush.intents, 3);
    assert_eq!(flush.envelopes.len(), 1);
    let doc_ids: Vec<_> = flush.envelopes[0]
        .ops
        .iter()
        .map(|op| op.value.as_ref().unwrap()["data"]["doc_id"].clone())
        .collect();
    assert_eq!(doc_ids, vec![json!("a"), json!("b"), json!("c")]);
    assert!(batcher.deadline().is_none());
    assert_eq!(batcher.pending(), 0);
}

#[test]
fn large_batches_split_under_one_batch_prefix() {
    let tr = translator();
    let mut ctx = TranslationContext::new("dm", 1000);
    let mut batcher = IntentBatcher::new(Duration::from_millis(50)).with_max_ops(2);
    let now = Instant::now();
    for id in ["a", "b", "c", "d", "e"] {
        batcher.add_intent(doc(id), now);
    }

    let flush = batcher.flush(&tr, &mut ctx);

    assert_eq!(flush.envelopes.len(), 3);
    assert_eq!(flush.op_count(), 5);
    let ids: Vec<_> = flush.envelopes.iter().map(|e| e.batch_id.clone().unwrap()).collect();
    let prefix = ids[0].strip_suffix("-0").unwrap();
    assert!(prefix.starts_with("batch-"));
    assert_eq!(ids[2], format!("{}-2", prefix));
}

#[test]
fn translation_errors_do_not_block_the_batch() {
    let tr = translator();
    let mut ctx = TranslationContext::new("dm", 1000);
    let mut batcher = IntentBatcher::new(Duration::from_millis(50));
    let now = Instant::now();
    batcher.add_intent(Intent::show_panel("hologram", PanelData::new()), now);
    batcher.add_intent(doc("a"), now);

    let flush = batcher.flush(&tr, &mut ctx);

    assert_eq!(flush.errors.len(), 1);
    assert_eq!(flush.op_count(), 1);
}

#[test]
fn destroy_drops_queue_and_refuses_more() {
    let mut batcher = IntentBatcher::new(Duration::from_millis(50));
    let now = Instant::now();
    batcher.add_intent(doc("a"), now);
    batcher.add_intent(doc("b"), now);

    assert_eq!(batcher.destroy(), 2);
    assert!(batcher.deadline().is_none());
    assert!(!batcher.add_intent(doc("c"), now));
    assert_eq!(batcher.pending(), 0);
    assert!(batcher.is_destroyed());
}

// ===========================================================================
// Pipeline
// ===========================================================================

#[test]
fn repeated_show_panel_keeps_one_panel() {
    let mut p = pipeline("dm");
    p.add_intent(Intent::show_panel("map", map_data()), Instant::now());
    p.flush();
    p.add_intent(Intent::show_panel("map", map_data()), Instant::now());
    p.flush();

    let state = p.state();
    assert_eq!(state.panel_ids(), vec!["map_2c9d516e"]);
    assert_eq!(p.budget().panel_count, 1);
    assert_eq!(p.budget().update_count, 1);
}

#[test]
fn duplicate_show_panel_in_one_batch_is_upserted() {
    let mut p = pipeline("dm");
    let now = Instant::now();
    p.add_intent(Intent::show_panel("map", map_data()), now);
    p.add_intent(Intent::show_panel("map", map_data()), now);
    let out = p.flush();

    assert!(matches!(out[0], Dispatch::Committed { applied: 2, .. }));
    assert_eq!(p.state().len(), 1);
}

#[test]
fn poll_waits_for_the_deadline() {
    let mut p = pipeline("dm");
    let t0 = Instant::now();
    p.add_intent(doc("a"), t0);

    assert!(p.poll(t0 + Duration::from_millis(10)).is_empty());
    assert_eq!(p.pending_intents(), 1);
    let out = p.poll(t0 + Duration::from_millis(50));
    assert_eq!(out.len(), 1);
    assert_eq!(p.state().len(), 1);
}

#[test]
fn raw_envelope_drains_pending_intents_first() {
    let mut p = pipeline("dm");
    p.add_intent(Intent::show_panel("map", map_data()), Instant::now());

    let out = p.apply_envelope(PatchEnvelope::new(vec![PatchOperation::remove("/panels/map_2c9d516e")]));

    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|d| matches!(d, Dispatch::Committed { .. })));
    assert!(p.state().is_empty());
}

#[test]
fn invalid_paths_trip_breaker_and_refuse_further_envelopes() {
    let mut p = pipeline("dm");
    let now = Instant::now();

    let out = p.handle_event(StreamEvent::Patch(bad_path_envelope()), now);
    assert!(matches!(out[0], Dispatch::Rejected { .. }));
    assert!(!p.is_safe_mode());

    let out = p.handle_event(StreamEvent::Patch(bad_path_envelope()), now);
    assert!(out.iter().any(|d| matches!(d, Dispatch::SafeModeEntered { .. })));
    assert_eq!(p.breaker().stats().consecutive_validation_failures, 2);

    let out = p.handle_event(StreamEvent::Patch(bad_path_envelope()), now);
    assert!(matches!(out[..], [Dispatch::Refused { .. }]));
    let out = p.handle_event(StreamEvent::Intent(doc("a")), now);
    assert!(matches!(out[..], [Dispatch::Refused { .. }]));
}

#[test]
fn permission_violations_enter_safe_mode_keeping_panels() {
    let mut p = pipeline("dm");
    p.add_intent(Intent::show_panel("map", map_data()), Instant::now());
    p.flush();

    for _ in 0..2 {
        p.add_intent(Intent::show_panel("policy_editor", PanelData::new()), Instant::now());
        p.flush();
    }

    let state = p.state();
    assert!(state.safe_mode);
    assert_eq!(state.panel_ids(), vec![SAFE_MODE_PANEL, "map_2c9d516e"]);
    assert_eq!(p.breaker().stats().permission_violations, 2);
    assert!(!p.health().healthy);
    assert_eq!(p.health().status, BreakerStatus::Broken);
}

#[test]
fn upstream_unknown_error_trips_immediately() {
    let mut p = pipeline("dm");
    let out = p.record_upstream_error("connection reset by peer", None);

    assert!(matches!(out[0], Dispatch::UpstreamError(_)));
    assert!(matches!(out[1], Dispatch::SafeModeEntered { .. }));
    assert!(p.is_safe_mode());
}

#[test]
fn error_signal_drains_queue_before_tripping() {
    let mut p = pipeline("dm");
    p.add_intent(doc("a"), Instant::now());
    let out = p.handle_event(
        StreamEvent::Error(ErrorSignal {
            message: "boom".into(),
            category: Some(ErrorCategory::Unknown),
        }),
        Instant::now(),
    );
    assert!(matches!(out[0], Dispatch::Committed { .. }));
    assert_eq!(p.state().len(), 2);
    assert_eq!(p.pending_intents(), 0);
}

#[test]
fn reset_run_starts_fresh() {
    let mut p = pipeline("dm");
    p.record_upstream_error("boom", Some(ErrorCategory::Unknown));
    let old_session = p.session_id().to_string();
    assert!(p.is_safe_mode());

    p.reset_run();

    assert!(!p.is_safe_mode());
    assert!(p.state().is_empty());
    assert_ne!(p.session_id(), old_session);
    assert_eq!(p.state().session_id.as_deref(), Some(p.session_id()));
    assert_eq!(p.health().status, BreakerStatus::Healthy);
    assert_eq!(*p.budget(), BudgetTracker::new());

    p.add_intent(doc("a"), Instant::now());
    p.flush();
    assert_eq!(p.state().len(), 1);
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn ids_are_stable_across_calls() {
    for _ in 0..3 {
        assert_eq!(generate_panel_id("doc_viewer", Some("LP_2024"), None), "doc_viewer_d792d7e6");
    }
    let a = obj(json!({"policies": [{"id": "H1"}, {"id": "D2"}]}));
    assert_eq!(
        generate_panel_id_from_data("applicable_policies", &a, None),
        "applicable_policies_3dddd566"
    );
}

#[test]
fn same_intents_produce_same_state() {
    let run = || {
        let mut p = pipeline("dm");
        let now = Instant::now();
        p.add_intent(Intent::show_panel("map", map_data()), now);
        p.add_intent(doc("LP_2024"), now);
        p.flush();
        p.state().panel_ids().iter().map(|s| s.to_string()).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

// ===========================================================================
// Config
// ===========================================================================

#[test]
fn missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = DiffusionConfig::load(&dir.path().join("absent.toml"));
    assert_eq!(config.batch.window_ms, 50);
    assert_eq!(config.budget.stable.max_panels, 5);
    assert_eq!(config.budget.deep.max_weight, 40);
}

#[test]
fn partial_config_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diffusion.toml");
    std::fs::write(
        &path,
        "[batch]\nwindow_ms = 10\n\n[breaker]\nmax_total_failures = 9\n",
    )
    .unwrap();

    let config = DiffusionConfig::load(&path);

    assert_eq!(config.batch.window_ms, 10);
    assert_eq!(config.batch.max_ops_per_envelope, 20);
    assert_eq!(config.breaker.max_total_failures, 9);
    assert_eq!(config.breaker.max_unknown_errors, 1);
    assert!(!config.registry.panels.is_empty());
}

#[test]
fn invalid_config_falls_back_to_defaults() {
    assert!(DiffusionConfig::from_toml("[batch]\nmax_ops_per_envelope = 0\n").is_err());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diffusion.toml");
    std::fs::write(&path, "[batch]\nmax_ops_per_envelope = 50\n").unwrap();
    assert_eq!(DiffusionConfig::load(&path).batch.max_ops_per_envelope, 20);
}

#[test]
fn default_config_roundtrips_through_toml() {
    let config = DiffusionConfig::default();
    let back = DiffusionConfig::from_toml(&config.to_toml()).unwrap();
    assert_eq!(back.registry.panels, config.registry.panels);
    assert_eq!(back.budget.stable, config.budget.stable);
}

#[test]
fn custom_registry_from_config() {
    let toml = r#"
[registry]
version = "7"

[[registry.panels]]
kind = "map"
weight = 1
max_instances = 4
allow_updates = true
description = "map"
contexts = ["dm"]
"#;
    let config = DiffusionConfig::from_toml(toml).unwrap();
    let reg = Registry::from_config(&config.registry, &config.budget);
    assert_eq!(reg.version(), "7");
    assert_eq!(reg.kinds(), vec!["map", SAFE_MODE_PANEL]);
    assert!(!reg.is_panel_type_allowed("doc_viewer"));
    assert_eq!(reg.panels_for_context("dm").len(), 1);
}

#[test]
fn override_without_notice_kind_still_enters_a_valid_safe_mode() {
    let toml = r#"
[[registry.panels]]
kind = "doc_viewer"
weight = 1
max_instances = 5
allow_updates = true
description = "docs"
contexts = ["dm"]
"#;
    let config = DiffusionConfig::from_toml(toml).unwrap();
    let mut p = Pipeline::from_config(&config, "dm", RunMode::Stable);
    p.add_intent(doc("LP_2024"), Instant::now());
    p.flush();

    p.record_upstream_error("producer crashed", Some(ErrorCategory::Unknown));

    let state = p.state();
    assert!(state.safe_mode);
    assert_eq!(state.panels[0].kind, SAFE_MODE_PANEL);
    assert!(validate_state(&state, p.registry()).is_ok());
}
