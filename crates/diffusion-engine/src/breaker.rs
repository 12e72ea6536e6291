//! Circuit breaker and safe-mode transform
//!
//! HEALTHY → DEGRADED → BROKEN, one way. Every reducer outcome is recorded.
//! Failures bump per-category counters and land in a bounded history; the
//! first threshold crossed trips the breaker and records why. Successful
//! throughput is tracked in a sliding window so runaway generation trips it
//! too. Only `reset` (a new run) clears a trip.

use crate::config::BreakerConfig;
use crate::reducer::PatchResult;
use diffusion_core::{ApplyError, DashboardState, ErrorCategory, Panel, PanelData, SAFE_MODE_PANEL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerStatus {
    Healthy,
    /// Failures seen but no threshold crossed. Never blocks operations.
    Degraded,
    Broken,
}

impl BreakerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Broken => "broken",
        }
    }
}

/// One entry of the error history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_index: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub consecutive_validation_failures: u32,
    pub total_failures: u32,
    pub validation_errors: u32,
    pub budget_violations: u32,
    pub permission_violations: u32,
    pub not_found_errors: u32,
    pub unknown_errors: u32,
    /// Successful ops inside the current rate window.
    pub recent_ops: usize,
    pub is_broken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<i64>,
}

/// Read-only summary for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub status: BreakerStatus,
    pub stats: BreakerStats,
}

#[derive(Clone, Debug)]
struct Trip {
    reason: String,
    at_ms: i64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    consecutive_validation_failures: u32,
    total_failures: u32,
    validation_errors: u32,
    budget_violations: u32,
    permission_violations: u32,
    not_found_errors: u32,
    unknown_errors: u32,
    history: VecDeque<ErrorRecord>,
    /// (timestamp_ms, ops) of successful envelopes.
    rate_window: VecDeque<(i64, usize)>,
    trip: Option<Trip>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_validation_failures: 0,
            total_failures: 0,
            validation_errors: 0,
            budget_violations: 0,
            permission_violations: 0,
            not_found_errors: 0,
            unknown_errors: 0,
            history: VecDeque::new(),
            rate_window: VecDeque::new(),
            trip: None,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn record_patch_result(&mut self, result: &PatchResult, op_count: usize) {
        self.record_patch_result_at(result, op_count, chrono::Utc::now().timestamp_millis());
    }

    /// Record one reducer outcome observed at `now_ms`.
    pub fn record_patch_result_at(&mut self, result: &PatchResult, op_count: usize, now_ms: i64) {
        if result.success {
            self.record_throughput(result.applied, now_ms);
        }
        if result.has_errors() {
            self.record_errors_at(&result.errors, now_ms);
        } else if result.success {
            self.consecutive_validation_failures = 0;
        }
        debug!(
            "recorded envelope of {} ops: success={} errors={} broken={}",
            op_count,
            result.success,
            result.errors.len(),
            self.is_broken()
        );
    }

    /// Record a group of errors as one failure (one envelope, one translated
    /// batch, or one upstream signal).
    pub fn record_errors_at(&mut self, errors: &[ApplyError], now_ms: i64) {
        if errors.is_empty() {
            return;
        }
        self.total_failures += 1;
        if errors.iter().any(|e| e.category == ErrorCategory::Validation) {
            self.consecutive_validation_failures += 1;
        }
        for e in errors {
            match e.category {
                ErrorCategory::Validation => self.validation_errors += 1,
                ErrorCategory::Budget => self.budget_violations += 1,
                ErrorCategory::Permission => self.permission_violations += 1,
                ErrorCategory::NotFound => self.not_found_errors += 1,
                ErrorCategory::Unknown => self.unknown_errors += 1,
            }
            self.push_history(ErrorRecord {
                category: e.category,
                message: e.message.clone(),
                timestamp_ms: now_ms,
                op_index: e.op_index,
            });
        }
        self.check_thresholds(now_ms);
    }

    fn push_history(&mut self, record: ErrorRecord) {
        if self.config.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn record_throughput(&mut self, ops: usize, now_ms: i64) {
        let horizon = now_ms - self.config.rate_window_ms;
        while self.rate_window.front().is_some_and(|(ts, _)| *ts <= horizon) {
            self.rate_window.pop_front();
        }
        if ops > 0 {
            self.rate_window.push_back((now_ms, ops));
        }
        let recent = self.recent_ops();
        if recent > self.config.max_ops_per_window {
            self.trip_with(
                format!(
                    "rate limit exceeded: {} ops in {}ms (max {})",
                    recent, self.config.rate_window_ms, self.config.max_ops_per_window
                ),
                now_ms,
            );
        }
    }

    fn recent_ops(&self) -> usize {
        self.rate_window.iter().map(|(_, n)| n).sum()
    }

    fn check_thresholds(&mut self, now_ms: i64) {
        let c = &self.config;
        let reason = if self.consecutive_validation_failures >= c.max_consecutive_validation_failures {
            Some(format!(
                "{} consecutive validation failures",
                self.consecutive_validation_failures
            ))
        } else if self.total_failures >= c.max_total_failures {
            Some(format!("{} total failures", self.total_failures))
        } else if self.unknown_errors >= c.max_unknown_errors {
            Some(format!("{} unknown errors", self.unknown_errors))
        } else if self.permission_violations >= c.max_permission_violations {
            Some(format!(
                "{} permission violations (possible injection attempt)",
                self.permission_violations
            ))
        } else if self.budget_violations >= c.max_budget_violations {
            Some(format!("{} budget violations", self.budget_violations))
        } else {
            None
        };
        if let Some(reason) = reason {
            self.trip_with(reason, now_ms);
        }
    }

    /// First trip wins; later reasons are ignored.
    fn trip_with(&mut self, reason: String, now_ms: i64) {
        if self.trip.is_some() {
            return;
        }
        warn!("Circuit breaker tripped: {}", reason);
        self.trip = Some(Trip { reason, at_ms: now_ms });
    }

    pub fn should_allow_operation(&self) -> bool {
        self.trip.is_none()
    }

    pub fn is_broken(&self) -> bool {
        self.trip.is_some()
    }

    pub fn break_reason(&self) -> Option<&str> {
        self.trip.as_ref().map(|t| t.reason.as_str())
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }

    /// Errors recorded so far across every category.
    pub fn error_count(&self) -> u32 {
        self.validation_errors
            + self.budget_violations
            + self.permission_violations
            + self.not_found_errors
            + self.unknown_errors
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            consecutive_validation_failures: self.consecutive_validation_failures,
            total_failures: self.total_failures,
            validation_errors: self.validation_errors,
            budget_violations: self.budget_violations,
            permission_violations: self.permission_violations,
            not_found_errors: self.not_found_errors,
            unknown_errors: self.unknown_errors,
            recent_ops: self.recent_ops(),
            is_broken: self.is_broken(),
            break_reason: self.trip.as_ref().map(|t| t.reason.clone()),
            broken_at: self.trip.as_ref().map(|t| t.at_ms),
        }
    }

    pub fn status(&self) -> HealthStatus {
        let status = if self.is_broken() {
            BreakerStatus::Broken
        } else if self.total_failures > 0 {
            BreakerStatus::Degraded
        } else {
            BreakerStatus::Healthy
        };
        HealthStatus {
            healthy: status != BreakerStatus::Broken,
            status,
            stats: self.stats(),
        }
    }

    /// Clear every counter and the trip. Only called at run start.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

/// Transform `state` into its terminal safe-mode form.
///
/// Prepends a notice panel and sets `safe_mode`. Committed panels are kept.
/// A state already in safe mode is returned unchanged.
pub fn enter_safe_mode(state: &DashboardState, reason: &str, error_count: u32, now_ms: i64) -> DashboardState {
    if state.safe_mode {
        return state.clone();
    }

    let mut data = PanelData::new();
    data.insert("reason".into(), Value::String(reason.to_string()));
    data.insert("errorCount".into(), Value::from(error_count));
    data.insert("timestamp".into(), Value::from(now_ms));
    data.insert(
        "message".into(),
        Value::String("Dashboard updates paused after repeated errors. Results shown so far are kept.".into()),
    );

    let mut next = state.clone();
    next.panels.retain(|p| p.id != SAFE_MODE_PANEL);
    next.panels.insert(
        0,
        Panel::new(SAFE_MODE_PANEL, SAFE_MODE_PANEL, data, now_ms.max(1)),
    );
    next.safe_mode = true;
    next.error_count = next.error_count.max(error_count);
    next
}
