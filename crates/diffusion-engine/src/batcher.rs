//! Intent batcher: trailing-edge debounce over incoming intents
//!
//! Each `add_intent` pushes the flush deadline out to `now + window`. The
//! owner polls `is_due` (or sleeps until `deadline`) and then flushes. A flush
//! translates every queued intent against one shared `TranslationContext`,
//! in arrival order, and unions the ops into envelopes. Translation errors are
//! reported alongside but never hold back the rest of the batch.
//!
//! `destroy` drops whatever is queued. Dropped intents never reached committed
//! state, so there is nothing to roll back.

use crate::translate::{IntentTranslator, TranslationContext};
use diffusion_core::{ApplyError, Intent, PatchEnvelope, PatchOperation, MAX_OPS_PER_ENVELOPE};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of draining the queue once.
#[derive(Debug, Clone, Default)]
pub struct BatchFlush {
    pub envelopes: Vec<PatchEnvelope>,
    pub errors: Vec<ApplyError>,
    /// Intents consumed by this flush.
    pub intents: usize,
}

impl BatchFlush {
    pub fn op_count(&self) -> usize {
        self.envelopes.iter().map(|e| e.ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intents == 0
    }
}

pub struct IntentBatcher {
    window: Duration,
    max_ops: usize,
    queue: Vec<Intent>,
    deadline: Option<Instant>,
    destroyed: bool,
}

impl IntentBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_ops: MAX_OPS_PER_ENVELOPE,
            queue: Vec::new(),
            deadline: None,
            destroyed: false,
        }
    }

    pub fn with_max_ops(mut self, max_ops: usize) -> Self {
        self.max_ops = max_ops.clamp(1, MAX_OPS_PER_ENVELOPE);
        self
    }

    /// Queue an intent and restart the debounce window.
    /// Returns false once the batcher has been destroyed.
    pub fn add_intent(&mut self, intent: Intent, now: Instant) -> bool {
        if self.destroyed {
            debug!("batcher destroyed, dropping intent {:?}", intent.action);
            return false;
        }
        self.queue.push(intent);
        self.deadline = Some(now + self.window);
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Drain immediately, regardless of the deadline.
    pub fn flush(&mut self, translator: &IntentTranslator, ctx: &mut TranslationContext) -> BatchFlush {
        self.deadline = None;
        let intents = std::mem::take(&mut self.queue);
        if intents.is_empty() {
            return BatchFlush::default();
        }

        let mut ops: Vec<PatchOperation> = Vec::new();
        let mut errors = Vec::new();
        for intent in &intents {
            let t = translator.translate(intent, ctx);
            ops.extend(t.ops);
            errors.extend(t.errors);
        }

        let batch_id = format!("batch-{}", uuid::Uuid::new_v4());
        let chunks: Vec<&[PatchOperation]> = ops.chunks(self.max_ops).collect();
        let split = chunks.len() > 1;
        let envelopes = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let id = if split { format!("{}-{}", batch_id, i) } else { batch_id.clone() };
                PatchEnvelope::new(chunk.to_vec()).with_batch(id)
            })
            .collect::<Vec<_>>();

        debug!(
            "flushed {} intents into {} ops across {} envelopes ({} translation errors)",
            intents.len(),
            ops.len(),
            envelopes.len(),
            errors.len()
        );
        BatchFlush { envelopes, errors, intents: intents.len() }
    }

    /// Cancel the pending deadline and drop everything queued.
    pub fn destroy(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.deadline = None;
        self.destroyed = true;
        if dropped > 0 {
            info!("batcher destroyed, dropped {} queued intents", dropped);
        }
        dropped
    }
}
