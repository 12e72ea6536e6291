//! Patch reducer: atomic validate-and-apply
//!
//! Every envelope is applied to a working copy of the committed state and a
//! working copy of the budget. Soft errors (VALIDATION, NOT_FOUND) skip the
//! offending op and continue. Hard errors (BUDGET, PERMISSION) discard both
//! working copies. The final state is revalidated as a whole before it is
//! promoted, so a published state is never structurally invalid.

use crate::budget::BudgetTracker;
use crate::path::{PanelField, PanelPath, PanelRef};
use crate::registry::Registry;
use crate::schema::{parse_panel, validate_panel, validate_panel_data, validate_state};
use diffusion_core::{
    validate_envelope_shape, ApplyError, DashboardState, ErrorCategory, Panel, PatchEnvelope, PatchOp,
    PatchOperation, RunMode,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// An operation skipped because of a soft error.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RejectedOp {
    pub index: usize,
    pub op: PatchOperation,
    pub error: ApplyError,
}

/// Outcome of applying one envelope.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PatchResult {
    /// True when the envelope was committed (possibly with soft rejections).
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<DashboardState>,
    /// The error that decided a failed envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApplyError>,
    pub errors: Vec<ApplyError>,
    pub rejected_ops: Vec<RejectedOp>,
    /// Operations that took effect.
    pub applied: usize,
}

impl PatchResult {
    fn committed(state: DashboardState, applied: usize, rejected_ops: Vec<RejectedOp>) -> Self {
        Self {
            success: true,
            new_state: Some(state),
            error: None,
            errors: rejected_ops.iter().map(|r| r.error.clone()).collect(),
            rejected_ops,
            applied,
        }
    }

    fn failed(error: ApplyError, rejected_ops: Vec<RejectedOp>) -> Self {
        let mut errors: Vec<ApplyError> = rejected_ops.iter().map(|r| r.error.clone()).collect();
        if !errors.contains(&error) {
            errors.push(error.clone());
        }
        Self {
            success: false,
            new_state: None,
            error: Some(error),
            errors,
            rejected_ops,
            applied: 0,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Committed with no rejections at all.
    pub fn is_clean(&self) -> bool {
        self.success && self.errors.is_empty()
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.errors.iter().filter(|e| e.category == category).count()
    }
}

/// Applies envelopes against an injected, immutable registry.
#[derive(Clone)]
pub struct PatchReducer {
    registry: Arc<Registry>,
}

impl PatchReducer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply `envelope` to `state`.
    ///
    /// `state` is never mutated. `budget` is replaced with the charged working
    /// copy only when the envelope commits.
    pub fn apply_patch(
        &self,
        state: &DashboardState,
        envelope: &PatchEnvelope,
        budget: &mut BudgetTracker,
        mode: RunMode,
    ) -> PatchResult {
        if let Err(e) = validate_envelope_shape(envelope) {
            warn!("Envelope {:?} rejected: {}", envelope.batch_id, e);
            return PatchResult::failed(e, Vec::new());
        }

        let mut working = state.clone();
        let mut working_budget = budget.clone();
        let mut rejected = Vec::new();
        let mut applied = 0;

        for (index, op) in envelope.ops.iter().enumerate() {
            match self.apply_op(&mut working, &mut working_budget, op, mode) {
                Ok(()) => {
                    applied += 1;
                    debug!("op {} {} {} applied", index, op.op, op.path);
                }
                Err(e) => {
                    let e = e.at(index, op.path.clone());
                    if e.is_hard() {
                        warn!("Envelope {:?} aborted at op {}: {}", envelope.batch_id, index, e);
                        return PatchResult::failed(e, rejected);
                    }
                    debug!("op {} {} {} skipped: {}", index, op.op, op.path, e);
                    rejected.push(RejectedOp { index, op: op.clone(), error: e });
                }
            }
        }

        if applied == 0 {
            let first = rejected[0].error.clone();
            return PatchResult::failed(first, rejected);
        }

        if let Err(e) = validate_state(&working, &self.registry) {
            warn!("Envelope {:?} produced an invalid state: {}", envelope.batch_id, e);
            return PatchResult::failed(e, rejected);
        }

        working.error_count += rejected.len() as u32;
        *budget = working_budget;
        PatchResult::committed(working, applied, rejected)
    }

    fn apply_op(
        &self,
        state: &mut DashboardState,
        budget: &mut BudgetTracker,
        op: &PatchOperation,
        mode: RunMode,
    ) -> Result<(), ApplyError> {
        let path = PanelPath::parse(&op.path)?;
        if op.from.is_some() {
            debug!("ignoring `from` on {} {}", op.op, op.path);
        }
        match op.op {
            PatchOp::Add => self.apply_add(state, budget, &path, op.value.as_ref(), mode),
            PatchOp::Replace => self.apply_replace(state, budget, &path, op.value.as_ref(), mode),
            PatchOp::Remove => apply_remove(state, &path),
            PatchOp::Test => apply_test(state, &path, op.value.as_ref()),
        }
    }

    fn apply_add(
        &self,
        state: &mut DashboardState,
        budget: &mut BudgetTracker,
        path: &PanelPath,
        value: Option<&Value>,
        mode: RunMode,
    ) -> Result<(), ApplyError> {
        if path.field != PanelField::Whole {
            return Err(ApplyError::validation("add must target /panels/- or /panels/<index>"));
        }
        let position = match &path.target {
            PanelRef::Append => state.panels.len(),
            PanelRef::Index(i) if *i <= state.panels.len() => *i,
            PanelRef::Index(i) => {
                return Err(ApplyError::validation(format!(
                    "insert index {} out of range ({} panels)",
                    i,
                    state.panels.len()
                )))
            }
            PanelRef::Id(_) => {
                return Err(ApplyError::validation("add must target /panels/- or /panels/<index>"))
            }
        };

        let value = value.ok_or_else(|| ApplyError::validation("add requires a value"))?;
        let mut panel = parse_panel(value)?;
        validate_panel(&panel, &self.registry)?;

        if !self.registry.is_panel_allowed_for_context(&panel.kind, &state.context) {
            return Err(ApplyError::permission(format!(
                "panel type {} is not allowed in context {}",
                panel.kind, state.context
            )));
        }
        if !self
            .registry
            .can_create_more_instances(&panel.kind, state.count_of_kind(&panel.kind))
        {
            return Err(ApplyError::budget(format!(
                "instance limit reached for {}",
                panel.kind
            )));
        }

        let mut projected = budget.clone();
        self.registry.add_panel_to_budget(&mut projected, &panel.kind);
        self.registry.check_budget(&projected, mode)?;

        if state.contains(&panel.id) {
            return Err(ApplyError::validation(format!("duplicate panel id: {}", panel.id)));
        }

        if panel.context.is_none() {
            panel.context = Some(state.context.clone());
        }
        state.panels.insert(position, panel);
        *budget = projected;
        Ok(())
    }

    fn apply_replace(
        &self,
        state: &mut DashboardState,
        budget: &mut BudgetTracker,
        path: &PanelPath,
        value: Option<&Value>,
        mode: RunMode,
    ) -> Result<(), ApplyError> {
        let index = path.resolve(&state.panels)?;
        let value = value.ok_or_else(|| ApplyError::validation("replace requires a value"))?;
        let current = &state.panels[index];

        if !self.registry.can_update_panel(&current.kind) {
            return Err(ApplyError::validation(format!(
                "panel type {} does not allow updates",
                current.kind
            )));
        }

        let mut projected = budget.clone();
        self.registry.add_update_to_budget(&mut projected);
        self.registry.check_budget(&projected, mode)?;

        let replacement = match &path.field {
            PanelField::Whole => {
                let mut next = parse_panel(value)?;
                if next.kind != current.kind {
                    return Err(ApplyError::validation(format!(
                        "panel type is immutable ({} -> {})",
                        current.kind, next.kind
                    )));
                }
                if next.id != current.id && state.contains(&next.id) {
                    return Err(ApplyError::validation(format!("duplicate panel id: {}", next.id)));
                }
                if next.context.is_none() {
                    next.context = current.context.clone();
                }
                validate_panel(&next, &self.registry)?;
                next
            }
            PanelField::Data => {
                let data = value
                    .as_object()
                    .ok_or_else(|| ApplyError::validation("panel data must be an object"))?;
                let mut next = current.clone();
                next.data = data.clone();
                validate_panel_data(&next.kind, &next.data)?;
                next
            }
            PanelField::DataKey(key) => {
                let mut next = current.clone();
                next.data.insert(key.clone(), value.clone());
                validate_panel_data(&next.kind, &next.data)?;
                next
            }
            PanelField::Timestamp => {
                let ts = value
                    .as_i64()
                    .filter(|t| *t > 0)
                    .ok_or_else(|| ApplyError::validation("timestamp must be a positive integer"))?;
                Panel { timestamp: ts, ..current.clone() }
            }
            PanelField::Context => {
                let context = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    _ => return Err(ApplyError::validation("context must be a string or null")),
                };
                Panel { context, ..current.clone() }
            }
            PanelField::Id | PanelField::Kind => {
                return Err(ApplyError::validation("panel id and type cannot be replaced"));
            }
        };

        state.panels[index] = replacement;
        *budget = projected;
        Ok(())
    }
}

fn apply_remove(state: &mut DashboardState, path: &PanelPath) -> Result<(), ApplyError> {
    if path.field != PanelField::Whole {
        return Err(ApplyError::validation("remove must target a whole panel"));
    }
    let index = path.resolve(&state.panels)?;
    state.panels.remove(index);
    Ok(())
}

fn apply_test(state: &DashboardState, path: &PanelPath, value: Option<&Value>) -> Result<(), ApplyError> {
    let index = path.resolve(&state.panels)?;
    let expected = value.ok_or_else(|| ApplyError::validation("test requires a value"))?;
    let panel = &state.panels[index];

    let actual = match &path.field {
        PanelField::Whole => serde_json::to_value(panel)
            .map_err(|e| ApplyError::unknown(format!("panel serialization failed: {}", e)))?,
        PanelField::Data => Value::Object(panel.data.clone()),
        PanelField::DataKey(key) => panel.data.get(key).cloned().unwrap_or(Value::Null),
        PanelField::Timestamp => Value::from(panel.timestamp),
        PanelField::Context => panel.context.clone().map(Value::String).unwrap_or(Value::Null),
        PanelField::Id => Value::String(panel.id.clone()),
        PanelField::Kind => Value::String(panel.kind.clone()),
    };

    if &actual == expected {
        Ok(())
    } else {
        Err(ApplyError::validation(format!("test failed at panel {}", panel.id)))
    }
}
