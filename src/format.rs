use diffusion_core::{DashboardState, Panel};
use diffusion_engine::{HealthStatus, Registry};
use serde_json::Value;

use crate::replay::ReplayReport;

pub struct FormatOptions {
    /// Print health and counts only, no panels.
    pub summary_only: bool,
    /// Don't truncate long data values.
    pub raw: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            summary_only: false,
            raw: false,
        }
    }
}

const MAX_VALUE_CHARS: usize = 80;

pub fn format_snapshot(state: &DashboardState, opts: &FormatOptions) -> String {
    let mut out = String::new();
    let session = state.session_id.as_deref().unwrap_or("-");
    out.push_str(&format!("═══ Dashboard [{}] {} ═══\n", state.context, session));
    out.push_str(&format!(
        "Panels: {}   Errors: {}   Safe mode: {}\n\n",
        state.len(),
        state.error_count,
        if state.safe_mode { "yes" } else { "no" }
    ));

    if opts.summary_only {
        return out;
    }
    for (i, panel) in state.panels.iter().enumerate() {
        out.push_str(&format_panel(i, panel, opts));
    }
    out
}

fn format_panel(index: usize, panel: &Panel, opts: &FormatOptions) -> String {
    let mut out = format!("─── [{}] {} ({}) ───\n", index, panel.id, panel.kind);
    for (key, value) in &panel.data {
        out.push_str(&format!("  {}: {}\n", key, format_value(value, opts.raw)));
    }
    out.push('\n');
    out
}

fn format_value(value: &Value, raw: bool) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw || text.chars().count() <= MAX_VALUE_CHARS {
        return text;
    }
    let head: String = text.chars().take(MAX_VALUE_CHARS).collect();
    format!("{}… ({} chars)", head, text.chars().count())
}

pub fn format_health(health: &HealthStatus) -> String {
    let s = &health.stats;
    let mut out = format!(
        "Health: {} ({} failures: validation {}, budget {}, permission {}, not found {}, unknown {})\n",
        health.status.as_str(),
        s.total_failures,
        s.validation_errors,
        s.budget_violations,
        s.permission_violations,
        s.not_found_errors,
        s.unknown_errors
    );
    if let Some(reason) = &s.break_reason {
        out.push_str(&format!("Tripped: {}\n", reason));
    }
    out
}

pub fn format_report(report: &ReplayReport, opts: &FormatOptions) -> String {
    let mut out = format_snapshot(&report.state, opts);
    let t = &report.tally;
    out.push_str(&format!(
        "Replayed {} events in {} mode: {} envelopes committed, {} rejected, {} ops skipped, {} intent errors, {} refused\n",
        report.events,
        report.mode,
        t.committed,
        t.rejected,
        t.soft_rejected_ops,
        t.intent_errors,
        t.refused
    ));
    out.push_str(&format!(
        "Budget: {} panels, weight {}, {} updates\n",
        report.budget.panel_count, report.budget.total_weight, report.budget.update_count
    ));
    out.push_str(&format_health(&report.health));
    out
}

/// Registered kinds, optionally only those a context may create.
pub fn format_registry(registry: &Registry, context: Option<&str>) -> String {
    let mut out = format!("Registry v{}\n", registry.version());
    let specs = match context {
        Some(ctx) => registry.panels_for_context(ctx),
        None => registry
            .kinds()
            .into_iter()
            .filter_map(|k| registry.panel_spec(k))
            .collect(),
    };
    for spec in specs {
        let contexts = if spec.is_system_only() {
            "system".to_string()
        } else {
            spec.contexts.join(",")
        };
        out.push_str(&format!(
            "  {:<22} weight {}  max {}  {}  [{}]  {}\n",
            spec.kind,
            spec.weight,
            spec.max_instances,
            if spec.allow_updates { "rw" } else { "ro" },
            contexts,
            spec.description
        ));
    }
    out
}
