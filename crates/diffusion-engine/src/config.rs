//! Diffusion pipeline configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. Producer and consumer
//! must run with the same registry and budget tables.

use crate::registry::{default_panel_specs, PanelSpec};
use diffusion_core::{RunMode, MAX_OPS_PER_ENVELOPE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Intent batching window and envelope size.
    pub batch: BatchConfig,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Budget ceilings per run mode.
    pub budget: BudgetConfig,
    /// Panel kind table.
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Debounce window in milliseconds. Every new intent restarts it.
    pub window_ms: u64,
    /// Envelopes produced by a flush are split at this many ops.
    pub max_ops_per_envelope: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_consecutive_validation_failures: u32,
    pub max_total_failures: u32,
    pub max_unknown_errors: u32,
    /// Repeated permission violations are treated as a possible injection attempt.
    pub max_permission_violations: u32,
    pub max_budget_violations: u32,
    /// Capacity of the error-history ring buffer.
    pub history_capacity: usize,
    /// Sliding window for operation throughput, in milliseconds.
    pub rate_window_ms: i64,
    /// Successful operations allowed inside one rate window.
    pub max_ops_per_window: usize,
}

/// Ceilings for one run mode. Exceeding any dimension rejects the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_panels: u32,
    pub max_weight: u32,
    pub max_updates: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub stable: BudgetLimits,
    pub deep: BudgetLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Contract version shared with the producer.
    pub version: String,
    pub panels: Vec<PanelSpec>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for BatchConfig {
    fn default() -> Self {
        Self { window_ms: 50, max_ops_per_envelope: MAX_OPS_PER_ENVELOPE }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_validation_failures: 2,
            max_total_failures: 5,
            max_unknown_errors: 1,
            max_permission_violations: 2,
            max_budget_violations: 3,
            history_capacity: 50,
            rate_window_ms: 5_000,
            max_ops_per_window: 100,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            stable: BudgetLimits { max_panels: 5, max_weight: 12, max_updates: 20 },
            deep: BudgetLimits { max_panels: 15, max_weight: 40, max_updates: 60 },
        }
    }
}

impl BudgetConfig {
    pub fn limits(&self, mode: RunMode) -> &BudgetLimits {
        match mode {
            RunMode::Stable => &self.stable,
            RunMode::Deep => &self.deep,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { version: "1".into(), panels: default_panel_specs() }
    }
}

// ============================================================
// Loading
// ============================================================

impl DiffusionConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> diffusion_core::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| diffusion_core::Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make every envelope fail.
    pub fn validate(&self) -> diffusion_core::Result<()> {
        if self.batch.max_ops_per_envelope == 0 || self.batch.max_ops_per_envelope > MAX_OPS_PER_ENVELOPE {
            return Err(diffusion_core::Error::ConfigError(format!(
                "batch.max_ops_per_envelope must be between 1 and {}",
                MAX_OPS_PER_ENVELOPE
            )));
        }
        if self.registry.panels.is_empty() {
            return Err(diffusion_core::Error::ConfigError("registry.panels is empty".into()));
        }
        Ok(())
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
