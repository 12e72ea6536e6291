//! Panel registry and budget checks
//!
//! Static configuration: which panel kinds exist, which producer contexts may
//! create them, per-kind instance and weight limits, and the budget ceilings
//! for each run mode. Built once per process and shared as `Arc<Registry>`.

use crate::budget::BudgetTracker;
use crate::config::{BudgetConfig, BudgetLimits, RegistryConfig};
use diffusion_core::{ApplyError, RunMode, SAFE_MODE_PANEL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Weight charged for kinds the table does not list.
const DEFAULT_WEIGHT: u32 = 1;

/// One registered panel kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSpec {
    pub kind: String,
    pub weight: u32,
    pub max_instances: u32,
    pub allow_updates: bool,
    pub description: String,
    /// Producer contexts allowed to create this kind. Empty means system-only.
    #[serde(default)]
    pub contexts: Vec<String>,
}

impl PanelSpec {
    pub fn new(kind: &str, weight: u32, max_instances: u32, contexts: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            weight,
            max_instances,
            allow_updates: true,
            description: String::new(),
            contexts: contexts.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.allow_updates = false;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn is_system_only(&self) -> bool {
        self.contexts.is_empty()
    }
}

pub const CONTEXTS: [&str; 6] = ["dm", "evidence", "policy", "strategy", "vision", "feedback"];

/// The built-in panel table.
pub fn default_panel_specs() -> Vec<PanelSpec> {
    vec![
        PanelSpec::new("applicable_policies", 2, 2, &CONTEXTS)
            .describe("List of relevant planning policies"),
        PanelSpec::new("key_issues_matrix", 3, 1, &["dm"])
            .describe("Matrix of planning issues and their policy alignment"),
        PanelSpec::new("precedents", 2, 2, &["dm", "policy"])
            .describe("Relevant appeal decisions and case law"),
        PanelSpec::new("planning_balance", 3, 1, &["dm", "strategy"])
            .describe("Weighing of benefits and harms for decision"),
        PanelSpec::new("draft_decision", 4, 1, &["dm"])
            .describe("Recommended decision with reasons and conditions"),
        PanelSpec::new("evidence_snapshot", 2, 1, &["dm", "evidence"])
            .describe("Overview of site constraints and available documents"),
        PanelSpec::new("evidence_browser", 2, 1, &["evidence"])
            .describe("Search and browse evidence base with filters"),
        PanelSpec::new("evidence_gaps", 2, 1, &["evidence"])
            .describe("Analysis of evidence gaps and stale evidence"),
        PanelSpec::new("dependency_graph", 3, 1, &["evidence"])
            .read_only()
            .describe("Evidence-policy dependency graph"),
        PanelSpec::new("policy_editor", 3, 3, &["policy"])
            .describe("Edit and validate policy wording"),
        PanelSpec::new("conflict_heatmap", 2, 1, &["policy"])
            .read_only()
            .describe("Visualization of policy conflicts and tensions"),
        PanelSpec::new("scenario_compare", 4, 2, &["strategy"])
            .describe("Side-by-side comparison of strategy options"),
        PanelSpec::new("visual_compliance", 3, 1, &["vision"])
            .describe("Design code compliance check"),
        PanelSpec::new("consultation_themes", 2, 1, &["feedback"])
            .describe("Thematic analysis of consultation feedback"),
        PanelSpec::new("map", 3, 2, &["dm", "evidence"])
            .describe("Interactive map with spatial layers (requires lat/lng)"),
        PanelSpec::new("doc_viewer", 1, 5, &["dm", "evidence", "policy"])
            .describe("View policy documents with paragraph highlighting"),
        safe_mode_notice_spec(),
    ]
}

/// The system-only kind the safe-mode transform inserts.
pub fn safe_mode_notice_spec() -> PanelSpec {
    PanelSpec::new(SAFE_MODE_PANEL, 0, 1, &[])
        .read_only()
        .describe("Diagnostic notice shown after entering safe mode")
}

/// The registry: panel kinds plus the budget table, resolved by kind.
pub struct Registry {
    version: String,
    panels: HashMap<String, PanelSpec>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    budgets: BudgetConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default(), &BudgetConfig::default())
    }
}

impl Registry {
    pub fn new(version: impl Into<String>, budgets: BudgetConfig) -> Self {
        Self {
            version: version.into(),
            panels: HashMap::new(),
            order: Vec::new(),
            budgets,
        }
    }

    pub fn from_config(registry: &RegistryConfig, budgets: &BudgetConfig) -> Self {
        let mut reg = Self::new(registry.version.clone(), budgets.clone());
        for spec in &registry.panels {
            reg.register(spec.clone());
        }
        if !reg.is_panel_type_allowed(SAFE_MODE_PANEL) {
            reg.register(safe_mode_notice_spec());
        }
        reg
    }

    /// Register a kind. Replaces any existing kind with the same name.
    pub fn register(&mut self, spec: PanelSpec) {
        if !self.panels.contains_key(&spec.kind) {
            self.order.push(spec.kind.clone());
        }
        self.panels.insert(spec.kind.clone(), spec);
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn panel_spec(&self, kind: &str) -> Option<&PanelSpec> {
        self.panels.get(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Kinds a producer running in `context` may create.
    pub fn panels_for_context(&self, context: &str) -> Vec<&PanelSpec> {
        self.order
            .iter()
            .filter_map(|k| self.panels.get(k))
            .filter(|s| s.contexts.iter().any(|c| c == context))
            .collect()
    }

    pub fn is_panel_type_allowed(&self, kind: &str) -> bool {
        self.panels.contains_key(kind)
    }

    pub fn is_panel_allowed_for_context(&self, kind: &str, context: &str) -> bool {
        self.panels
            .get(kind)
            .is_some_and(|s| s.contexts.iter().any(|c| c == context))
    }

    pub fn can_create_more_instances(&self, kind: &str, current_count: usize) -> bool {
        self.panels
            .get(kind)
            .is_some_and(|s| current_count < s.max_instances as usize)
    }

    pub fn panel_weight(&self, kind: &str) -> u32 {
        self.panels.get(kind).map(|s| s.weight).unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn can_update_panel(&self, kind: &str) -> bool {
        self.panels.get(kind).is_some_and(|s| s.allow_updates)
    }

    pub fn limits(&self, mode: RunMode) -> &BudgetLimits {
        self.budgets.limits(mode)
    }

    /// Check the tracker against the ceilings of `mode`.
    ///
    /// Callers charge a working copy first and check afterwards, so a rejection
    /// means the charge would push the run past a ceiling.
    pub fn check_budget(&self, tracker: &BudgetTracker, mode: RunMode) -> Result<(), ApplyError> {
        let limits = self.limits(mode);
        if tracker.panel_count > limits.max_panels {
            return Err(ApplyError::budget(format!(
                "panel limit reached ({} panels in {} mode)",
                limits.max_panels, mode
            )));
        }
        if tracker.total_weight > limits.max_weight {
            return Err(ApplyError::budget(format!(
                "weight budget exceeded ({} > {} in {} mode)",
                tracker.total_weight, limits.max_weight, mode
            )));
        }
        if tracker.update_count > limits.max_updates {
            return Err(ApplyError::budget(format!(
                "update limit reached ({} updates in {} mode)",
                limits.max_updates, mode
            )));
        }
        Ok(())
    }

    pub fn add_panel_to_budget(&self, tracker: &mut BudgetTracker, kind: &str) {
        tracker.add_panel(kind, self.panel_weight(kind));
    }

    pub fn add_update_to_budget(&self, tracker: &mut BudgetTracker) {
        tracker.add_update();
    }
}
