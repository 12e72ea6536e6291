//! Intent translator: high-level intents into patch operations
//!
//! `show_panel` becomes an `add` for a new id and silently turns into a data
//! replace when the derived id is already present, so repeating an intent
//! never produces a duplicate-id error. All emitted paths address panels by id.

use crate::ids::generate_panel_id_from_data;
use crate::path::{append_path, data_path, id_path};
use crate::registry::Registry;
use diffusion_core::{
    ApplyError, DashboardState, Intent, IntentAction, Panel, PatchOperation, MAX_OPS_PER_ENVELOPE,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Shared view of the panels known while translating one batch.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    /// Producer context (module) of the session.
    pub context: String,
    /// Known panel ids in display order.
    order: Vec<String>,
    kinds: HashMap<String, String>,
    /// Timestamp stamped on panels created by this batch.
    pub now_ms: i64,
}

impl TranslationContext {
    pub fn new(context: impl Into<String>, now_ms: i64) -> Self {
        Self {
            context: context.into(),
            order: Vec::new(),
            kinds: HashMap::new(),
            now_ms,
        }
    }

    pub fn from_state(state: &DashboardState, now_ms: i64) -> Self {
        let mut ctx = Self::new(state.context.clone(), now_ms);
        for panel in &state.panels {
            ctx.track(&panel.id, &panel.kind);
        }
        ctx
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.kinds.contains_key(id)
    }

    pub fn kind_of(&self, id: &str) -> Option<&str> {
        self.kinds.get(id).map(String::as_str)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|k| k == id)
    }

    pub fn known_ids(&self) -> &[String] {
        &self.order
    }

    fn track(&mut self, id: &str, kind: &str) {
        if self.kinds.insert(id.to_string(), kind.to_string()).is_none() {
            self.order.push(id.to_string());
        }
    }

    fn forget(&mut self, id: &str) {
        if self.kinds.remove(id).is_some() {
            self.order.retain(|k| k != id);
        }
    }
}

/// Ops and errors produced by one intent.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub ops: Vec<PatchOperation>,
    pub errors: Vec<ApplyError>,
}

impl Translation {
    fn op(op: PatchOperation) -> Self {
        Self { ops: vec![op], errors: Vec::new() }
    }

    fn error(e: ApplyError) -> Self {
        Self { ops: Vec::new(), errors: vec![e] }
    }
}

pub struct IntentTranslator {
    registry: Arc<Registry>,
}

impl IntentTranslator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn translate(&self, intent: &Intent, ctx: &mut TranslationContext) -> Translation {
        match intent.kind() {
            IntentAction::ShowPanel => self.show_panel(intent, ctx),
            IntentAction::UpdatePanel => self.update_panel(intent, ctx),
            IntentAction::RemovePanel => remove_panel(intent, ctx),
            IntentAction::Patch => patch(intent, ctx),
            IntentAction::Administrative(action) => {
                if action.trim().is_empty() {
                    return Translation::error(ApplyError::validation("intent action must not be empty"));
                }
                debug!("administrative intent {:?} produces no ops", action);
                Translation::default()
            }
        }
    }

    fn show_panel(&self, intent: &Intent, ctx: &mut TranslationContext) -> Translation {
        let Some(kind) = intent.panel.as_deref().filter(|k| !k.is_empty()) else {
            return Translation::error(ApplyError::validation("show_panel requires a panel type"));
        };
        if !self.registry.is_panel_type_allowed(kind) {
            return Translation::error(ApplyError::validation(format!("unknown panel type: {}", kind)));
        }
        if !self.registry.is_panel_allowed_for_context(kind, &ctx.context) {
            return Translation::error(ApplyError::permission(format!(
                "panel type {} is not allowed in context {}",
                kind, ctx.context
            )));
        }

        let data = intent.data.clone().unwrap_or_default();
        let id = intent
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_panel_id_from_data(kind, &data, None));

        if ctx.is_known(&id) {
            if !self.registry.can_update_panel(kind) {
                debug!("show_panel {} already present and not updatable, skipping", id);
                return Translation::default();
            }
            debug!("show_panel {} already present, upserting data", id);
            return Translation::op(PatchOperation::replace(data_path(&id), Value::Object(data)));
        }

        let panel = Panel::new(id.clone(), kind, data, ctx.now_ms).with_context(ctx.context.clone());
        match serde_json::to_value(&panel) {
            Ok(value) => {
                ctx.track(&id, kind);
                Translation::op(PatchOperation::add(append_path(), value))
            }
            Err(e) => Translation::error(ApplyError::unknown(format!("panel serialization failed: {}", e))),
        }
    }

    fn update_panel(&self, intent: &Intent, ctx: &mut TranslationContext) -> Translation {
        let Some(id) = target_id(intent, ctx) else {
            return Translation::error(ApplyError::validation("update_panel requires an id"));
        };
        let Some(kind) = ctx.kind_of(&id).map(String::from) else {
            return Translation::error(ApplyError::not_found(format!("panel not found: {}", id)));
        };
        if !self.registry.can_update_panel(&kind) {
            return Translation::error(ApplyError::validation(format!(
                "panel type {} does not allow updates",
                kind
            )));
        }
        let data = intent.data.clone().unwrap_or_default();
        Translation::op(PatchOperation::replace(data_path(&id), Value::Object(data)))
    }
}

/// Explicit id, or the bare kind id for single-instance panels.
fn target_id(intent: &Intent, ctx: &TranslationContext) -> Option<String> {
    if let Some(id) = intent.id.as_deref().filter(|id| !id.is_empty()) {
        return Some(id.to_string());
    }
    let kind = intent.panel.as_deref()?;
    ctx.is_known(kind).then(|| kind.to_string())
}

fn remove_panel(intent: &Intent, ctx: &mut TranslationContext) -> Translation {
    let Some(id) = target_id(intent, ctx) else {
        return Translation::error(ApplyError::validation("remove_panel requires an id"));
    };
    if !ctx.is_known(&id) {
        return Translation::error(ApplyError::not_found(format!("panel not found: {}", id)));
    }
    ctx.forget(&id);
    Translation::op(PatchOperation::remove(id_path(&id)))
}

/// Pass-through of raw ops in `data.ops` after shape validation.
fn patch(intent: &Intent, ctx: &mut TranslationContext) -> Translation {
    let Some(raw) = intent.data.as_ref().and_then(|d| d.get("ops")) else {
        return Translation::error(ApplyError::validation("patch intent requires data.ops"));
    };
    let ops: Vec<PatchOperation> = match serde_json::from_value(raw.clone()) {
        Ok(ops) => ops,
        Err(e) => return Translation::error(ApplyError::validation(format!("malformed patch ops: {}", e))),
    };
    if ops.len() > MAX_OPS_PER_ENVELOPE {
        return Translation::error(ApplyError::validation(format!(
            "patch intent carries {} ops (max {})",
            ops.len(),
            MAX_OPS_PER_ENVELOPE
        )));
    }

    let mut out = Translation::default();
    for op in ops {
        if !op.path.starts_with("/panels/") {
            out.errors.push(ApplyError::validation(format!(
                "path must address /panels/..., got {:?}",
                op.path
            )));
            continue;
        }
        track_raw_op(&op, ctx);
        out.ops.push(op);
    }
    out
}

/// Keep the context in step with raw adds and removes so later intents in the
/// same batch see them.
fn track_raw_op(op: &PatchOperation, ctx: &mut TranslationContext) {
    use diffusion_core::PatchOp;
    match op.op {
        PatchOp::Add => {
            if let Some(v) = &op.value {
                if let (Some(id), Some(kind)) = (
                    v.get("id").and_then(Value::as_str),
                    v.get("type").and_then(Value::as_str),
                ) {
                    ctx.track(id, kind);
                }
            }
        }
        PatchOp::Remove => {
            if let Ok(p) = crate::path::PanelPath::parse(&op.path) {
                if let crate::path::PanelRef::Id(id) = p.target {
                    ctx.forget(&id);
                }
            }
        }
        _ => {}
    }
}
