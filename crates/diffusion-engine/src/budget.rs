//! Per-run budget counters
//!
//! Counters only grow within a run; removing a panel refunds nothing. A new
//! run starts from a fresh tracker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTracker {
    pub panel_count: u32,
    pub total_weight: u32,
    pub update_count: u32,
    pub per_type: BTreeMap<String, u32>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_panel(&mut self, kind: &str, weight: u32) {
        self.panel_count += 1;
        self.total_weight += weight;
        *self.per_type.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn add_update(&mut self) {
        self.update_count += 1;
    }

    pub fn count_for(&self, kind: &str) -> u32 {
        self.per_type.get(kind).copied().unwrap_or(0)
    }
}
