//! Pipeline: one run of the diffusion core, synchronous
//!
//! Owns the committed state, the run's budget, the breaker and the batcher.
//! Events enter in receipt order; raw envelopes and terminal signals drain
//! pending intents first so nothing is reordered. Nothing here awaits or does
//! I/O: the async session drives the debounce deadline from outside.

use crate::batcher::IntentBatcher;
use crate::breaker::{enter_safe_mode, CircuitBreaker, HealthStatus};
use crate::budget::BudgetTracker;
use crate::config::DiffusionConfig;
use crate::reducer::{PatchReducer, RejectedOp};
use crate::registry::Registry;
use crate::translate::{IntentTranslator, TranslationContext};
use diffusion_core::{
    ApplyError, DashboardState, ErrorCategory, ErrorSignal, Intent, PatchEnvelope, RunMode,
    StreamEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one unit of work handed to the pipeline.
#[derive(Clone, Debug)]
pub enum Dispatch {
    /// Envelope committed; `state` is the new snapshot.
    Committed {
        batch_id: Option<String>,
        state: Arc<DashboardState>,
        applied: usize,
        rejected: Vec<RejectedOp>,
    },
    /// Envelope discarded with zero mutation.
    Rejected {
        batch_id: Option<String>,
        error: ApplyError,
        errors: Vec<ApplyError>,
    },
    /// Intents that produced no ops.
    TranslationFailed(Vec<ApplyError>),
    /// Out-of-band producer failure, recorded by the breaker.
    UpstreamError(ApplyError),
    /// Refused because the breaker is open.
    Refused { reason: String },
    SafeModeEntered {
        reason: String,
        /// Queued intents dropped by tearing down the batcher.
        dropped: usize,
        state: Arc<DashboardState>,
    },
}

pub struct Pipeline {
    registry: Arc<Registry>,
    reducer: PatchReducer,
    translator: IntentTranslator,
    config: DiffusionConfig,
    mode: RunMode,
    context: String,
    session_id: String,
    state: Arc<DashboardState>,
    budget: BudgetTracker,
    breaker: CircuitBreaker,
    batcher: IntentBatcher,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

fn new_batcher(config: &DiffusionConfig) -> IntentBatcher {
    IntentBatcher::new(Duration::from_millis(config.batch.window_ms))
        .with_max_ops(config.batch.max_ops_per_envelope)
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        config: &DiffusionConfig,
        context: impl Into<String>,
        mode: RunMode,
    ) -> Self {
        let context = context.into();
        let session_id = new_session_id();
        info!(
            "Pipeline {} started (context={}, mode={}, registry v{})",
            session_id,
            context,
            mode,
            registry.version()
        );
        Self {
            reducer: PatchReducer::new(registry.clone()),
            translator: IntentTranslator::new(registry.clone()),
            registry,
            config: config.clone(),
            mode,
            state: Arc::new(DashboardState::new(context.clone()).with_session(session_id.clone())),
            context,
            session_id,
            budget: BudgetTracker::new(),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            batcher: new_batcher(config),
        }
    }

    /// Pipeline with a registry built from `config`.
    pub fn from_config(config: &DiffusionConfig, context: impl Into<String>, mode: RunMode) -> Self {
        let registry = Arc::new(Registry::from_config(&config.registry, &config.budget));
        Self::new(registry, config, context, mode)
    }

    pub fn state(&self) -> Arc<DashboardState> {
        self.state.clone()
    }

    pub fn health(&self) -> HealthStatus {
        self.breaker.status()
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state.safe_mode
    }

    /// When the pending batch becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.batcher.deadline()
    }

    pub fn pending_intents(&self) -> usize {
        self.batcher.pending()
    }

    fn refused(&self) -> Dispatch {
        Dispatch::Refused {
            reason: self
                .breaker
                .break_reason()
                .unwrap_or("circuit breaker open")
                .to_string(),
        }
    }

    /// Queue an intent behind the debounce window.
    pub fn add_intent(&mut self, intent: Intent, now: Instant) -> Vec<Dispatch> {
        if !self.breaker.should_allow_operation() {
            debug!("breaker open, refusing intent {:?}", intent.action);
            return vec![self.refused()];
        }
        self.batcher.add_intent(intent, now);
        Vec::new()
    }

    /// Flush if the debounce deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<Dispatch> {
        if self.batcher.is_due(now) {
            self.flush()
        } else {
            Vec::new()
        }
    }

    /// Drain queued intents now.
    pub fn flush(&mut self) -> Vec<Dispatch> {
        if self.batcher.pending() == 0 {
            return Vec::new();
        }
        let now = now_ms();
        let mut ctx = TranslationContext::from_state(&self.state, now);
        let batch = self.batcher.flush(&self.translator, &mut ctx);
        info!(
            "Flushing {} intents: {} envelopes, {} ops, {} translation errors",
            batch.intents,
            batch.envelopes.len(),
            batch.op_count(),
            batch.errors.len()
        );

        let mut out = Vec::new();
        for envelope in batch.envelopes {
            out.push(self.commit(envelope, now));
        }
        if !batch.errors.is_empty() && self.breaker.should_allow_operation() {
            self.breaker.record_errors_at(&batch.errors, now);
            out.push(Dispatch::TranslationFailed(batch.errors));
        }
        out.extend(self.check_safe_mode(now));
        out
    }

    /// Apply a raw envelope after draining anything queued before it.
    pub fn apply_envelope(&mut self, envelope: PatchEnvelope) -> Vec<Dispatch> {
        let mut out = self.flush();
        let now = now_ms();
        out.push(self.commit(envelope, now));
        out.extend(self.check_safe_mode(now));
        out
    }

    /// Feed an out-of-band producer failure to the breaker.
    pub fn record_upstream_error(
        &mut self,
        message: impl Into<String>,
        category: Option<ErrorCategory>,
    ) -> Vec<Dispatch> {
        let signal = ErrorSignal {
            message: message.into(),
            category,
        };
        let mut out = self.flush();
        if !self.breaker.should_allow_operation() {
            debug!("breaker open, ignoring upstream error: {}", signal.message);
            return out;
        }
        let error = signal.to_apply_error();
        warn!("Upstream error ({}): {}", error.category, error.message);
        let now = now_ms();
        self.breaker.record_errors_at(std::slice::from_ref(&error), now);
        out.push(Dispatch::UpstreamError(error));
        out.extend(self.check_safe_mode(now));
        out
    }

    /// Terminal signal: drain what is queued.
    pub fn finish(&mut self) -> Vec<Dispatch> {
        self.flush()
    }

    /// Tear down the batcher, dropping queued intents. Returns the drop count.
    pub fn shutdown(&mut self) -> usize {
        self.batcher.destroy()
    }

    /// Route one stream event.
    pub fn handle_event(&mut self, event: StreamEvent, now: Instant) -> Vec<Dispatch> {
        debug!("event: {}", event.name());
        match event {
            StreamEvent::Intent(intent) => self.add_intent(intent, now),
            StreamEvent::Patch(envelope) => {
                if !self.breaker.should_allow_operation() {
                    return vec![self.refused()];
                }
                self.apply_envelope(envelope)
            }
            StreamEvent::Error(signal) => self.record_upstream_error(signal.message, signal.category),
            StreamEvent::Done => self.finish(),
        }
    }

    /// Start a new run: fresh state, budget, breaker and batcher.
    pub fn reset_run(&mut self) {
        let dropped = self.batcher.destroy();
        self.session_id = new_session_id();
        self.state = Arc::new(
            DashboardState::new(self.context.clone()).with_session(self.session_id.clone()),
        );
        self.budget = BudgetTracker::new();
        self.breaker.reset();
        self.batcher = new_batcher(&self.config);
        info!("Run reset, session {} (dropped {} queued intents)", self.session_id, dropped);
    }

    fn commit(&mut self, mut envelope: PatchEnvelope, now: i64) -> Dispatch {
        if !self.breaker.should_allow_operation() {
            return self.refused();
        }
        if envelope.session_id.is_none() {
            envelope.session_id = Some(self.session_id.clone());
        }

        let result = self
            .reducer
            .apply_patch(&self.state, &envelope, &mut self.budget, self.mode);
        self.breaker.record_patch_result_at(&result, envelope.len(), now);

        match result.new_state {
            Some(next) if result.success => {
                self.state = Arc::new(next);
                Dispatch::Committed {
                    batch_id: envelope.batch_id,
                    state: self.state.clone(),
                    applied: result.applied,
                    rejected: result.rejected_ops,
                }
            }
            _ => Dispatch::Rejected {
                batch_id: envelope.batch_id,
                error: result
                    .error
                    .unwrap_or_else(|| ApplyError::unknown("envelope rejected")),
                errors: result.errors,
            },
        }
    }

    /// Enter safe mode once, the first time the breaker is seen open.
    fn check_safe_mode(&mut self, now: i64) -> Option<Dispatch> {
        if !self.breaker.is_broken() || self.state.safe_mode {
            return None;
        }
        let reason = self
            .breaker
            .break_reason()
            .unwrap_or("circuit breaker open")
            .to_string();
        let dropped = self.batcher.destroy();
        self.state = Arc::new(enter_safe_mode(
            &self.state,
            &reason,
            self.breaker.error_count(),
            now,
        ));
        warn!(
            "Entered safe mode: {} ({} panels kept, {} queued intents dropped)",
            reason,
            self.state.len() - 1,
            dropped
        );
        Some(Dispatch::SafeModeEntered {
            reason,
            dropped,
            state: self.state.clone(),
        })
    }
}
