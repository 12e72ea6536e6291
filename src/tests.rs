use crate::format::{format_health, format_registry, format_snapshot, FormatOptions};
use crate::parser::parse_lines;
use diffusion_core::{ApplyError, DashboardState, Panel, PanelData, StreamEvent};
use diffusion_engine::{BreakerConfig, CircuitBreaker, Registry};
use serde_json::json;

fn sample_state() -> DashboardState {
    let data: PanelData = json!({
        "doc_id": "LP_2024",
        "summary": "x".repeat(200),
    })
    .as_object()
    .cloned()
    .unwrap();
    let mut state = DashboardState::new("dm").with_session("session-abc");
    state.panels.push(Panel::new("doc_viewer_d792d7e6", "doc_viewer", data, 1000));
    state
}

// ===========================================================================
// Parser
// ===========================================================================

#[test]
fn parse_mixed_stream() {
    let jsonl = r#"
{"type":"intent","data":{"action":"show_panel","panel":"map","data":{"center":{"lat":51.5,"lng":-0.12}}}}
// comment lines are ignored
{"ops":[{"op":"remove","path":"/panels/map"}]}
{"action":"status","message":"thinking"}
{"type":"error","data":{"message":"upstream timeout"}}
{"type":"done"}
"#;
    let result = parse_lines(jsonl);
    assert!(result.errors.is_empty());
    let names: Vec<_> = result.events.iter().map(StreamEvent::name).collect();
    assert_eq!(names, vec!["intent", "patch", "intent", "error", "done"]);
}

#[test]
fn parse_errors_carry_line_numbers() {
    let jsonl = "{\"type\":\"done\"}\nnot json\n\n{\"hello\":1}\n";
    let result = parse_lines(jsonl);
    assert_eq!(result.events.len(), 1);
    let lines: Vec<_> = result.errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![2, 4]);
}

#[test]
fn parse_stream_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");
    std::fs::write(&path, "{\"type\":\"done\"}\n").unwrap();
    let result = crate::parser::parse_stream(&path).unwrap();
    assert_eq!(result.events, vec![StreamEvent::Done]);
}

// ===========================================================================
// Format
// ===========================================================================

#[test]
fn snapshot_lists_panels_and_truncates() {
    let out = format_snapshot(&sample_state(), &FormatOptions::default());
    assert!(out.contains("═══ Dashboard [dm] session-abc ═══"));
    assert!(out.contains("─── [0] doc_viewer_d792d7e6 (doc_viewer) ───"));
    assert!(out.contains("doc_id: LP_2024"));
    assert!(out.contains("(200 chars)"));
}

#[test]
fn snapshot_raw_and_summary_options() {
    let raw = format_snapshot(
        &sample_state(),
        &FormatOptions {
            raw: true,
            ..FormatOptions::default()
        },
    );
    assert!(raw.contains(&"x".repeat(200)));

    let summary = format_snapshot(
        &sample_state(),
        &FormatOptions {
            summary_only: true,
            ..FormatOptions::default()
        },
    );
    assert!(summary.contains("Panels: 1"));
    assert!(!summary.contains("doc_viewer_d792d7e6"));
}

#[test]
fn health_line_shows_trip_reason() {
    let mut breaker = CircuitBreaker::new(BreakerConfig::default());
    assert!(format_health(&breaker.status()).starts_with("Health: healthy"));

    breaker.record_errors_at(&[ApplyError::unknown("boom")], 1);
    let out = format_health(&breaker.status());
    assert!(out.starts_with("Health: broken"));
    assert!(out.contains("Tripped: 1 unknown errors"));
}

#[test]
fn registry_listing_filters_by_context() {
    let reg = Registry::default();
    let all = format_registry(&reg, None);
    assert!(all.contains("safe_mode_notice"));
    assert!(all.contains("[system]"));

    let feedback = format_registry(&reg, Some("feedback"));
    assert!(feedback.contains("consultation_themes"));
    assert!(feedback.contains("applicable_policies"));
    assert!(!feedback.contains("draft_decision"));
}
