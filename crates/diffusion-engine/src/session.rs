//! Diffusion session: the single consumer of the upstream event stream
//!
//! One task owns the `Pipeline`. Events arrive on an mpsc channel in producer
//! order; the only other wake-up is the batcher's debounce deadline. Outcomes
//! go out on a broadcast channel and the latest snapshot on a watch channel.

use crate::breaker::HealthStatus;
use crate::pipeline::{Dispatch, Pipeline};
use diffusion_core::{ApplyError, DashboardState, Error, Result, StreamEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Session events: emitted to every subscriber
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// An envelope committed.
    StateUpdated {
        batch_id: Option<String>,
        state: Arc<DashboardState>,
        applied: usize,
        /// Soft-rejected ops within the committed envelope.
        rejected: usize,
    },
    /// An envelope was discarded with zero mutation.
    EnvelopeRejected {
        batch_id: Option<String>,
        error: ApplyError,
    },
    /// Intents that failed translation.
    IntentsRejected { errors: Vec<ApplyError> },
    UpstreamError { error: ApplyError },
    /// Event refused because the breaker is open.
    Refused { reason: String },
    SafeModeEntered {
        reason: String,
        dropped: usize,
        state: Arc<DashboardState>,
    },
    /// Session ended (terminal signal, closed stream or cancellation).
    Finished {
        state: Arc<DashboardState>,
        health: HealthStatus,
    },
}

impl From<Dispatch> for SessionEvent {
    fn from(d: Dispatch) -> Self {
        match d {
            Dispatch::Committed {
                batch_id,
                state,
                applied,
                rejected,
            } => SessionEvent::StateUpdated {
                batch_id,
                state,
                applied,
                rejected: rejected.len(),
            },
            Dispatch::Rejected { batch_id, error, .. } => {
                SessionEvent::EnvelopeRejected { batch_id, error }
            }
            Dispatch::TranslationFailed(errors) => SessionEvent::IntentsRejected { errors },
            Dispatch::UpstreamError(error) => SessionEvent::UpstreamError { error },
            Dispatch::Refused { reason } => SessionEvent::Refused { reason },
            Dispatch::SafeModeEntered {
                reason,
                dropped,
                state,
            } => SessionEvent::SafeModeEntered {
                reason,
                dropped,
                state,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Handle: producer side and subscriptions
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionHandle {
    events_tx: mpsc::Sender<StreamEvent>,
    output_tx: broadcast::Sender<SessionEvent>,
    state_rx: watch::Receiver<Arc<DashboardState>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub async fn send(&self, event: StreamEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| Error::Internal("session closed".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.output_tx.subscribe()
    }

    /// Latest committed snapshot.
    pub fn state(&self) -> Arc<DashboardState> {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<Arc<DashboardState>> {
        self.state_rx.clone()
    }

    /// Stop the session, dropping queued intents.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

pub struct DiffusionSession {
    pipeline: Pipeline,
    events_rx: mpsc::Receiver<StreamEvent>,
    output_tx: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<Arc<DashboardState>>,
    cancel: CancellationToken,
}

impl DiffusionSession {
    /// Returns `(session, handle)`. Spawn `session.run()`; feed it through the handle.
    pub fn new(pipeline: Pipeline) -> (Self, SessionHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (output_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(pipeline.state());
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            events_tx,
            output_tx: output_tx.clone(),
            state_rx,
            cancel: cancel.clone(),
        };
        let session = Self {
            pipeline,
            events_rx,
            output_tx,
            state_tx,
            cancel,
        };
        (session, handle)
    }

    /// Process events until `Done`, a closed stream, or cancellation.
    /// Returns the pipeline so callers can inspect the final run.
    pub async fn run(mut self) -> Pipeline {
        info!("DiffusionSession {} started", self.pipeline.session_id());
        loop {
            let deadline = self.pipeline.deadline();
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let dropped = self.pipeline.shutdown();
                    info!("DiffusionSession cancelled, dropped {} queued intents", dropped);
                    break;
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let out = self.pipeline.poll(Instant::now());
                    self.publish(out);
                }

                event = self.events_rx.recv() => match event {
                    Some(StreamEvent::Done) => {
                        debug!("terminal signal received");
                        let out = self.pipeline.finish();
                        self.publish(out);
                        break;
                    }
                    Some(event) => {
                        let out = self.pipeline.handle_event(event, Instant::now());
                        self.publish(out);
                    }
                    None => {
                        info!("DiffusionSession: stream closed");
                        let out = self.pipeline.finish();
                        self.publish(out);
                        break;
                    }
                },
            }
        }

        let _ = self.output_tx.send(SessionEvent::Finished {
            state: self.pipeline.state(),
            health: self.pipeline.health(),
        });
        info!("DiffusionSession {} stopped", self.pipeline.session_id());
        self.pipeline
    }

    fn publish(&self, dispatches: Vec<Dispatch>) {
        if dispatches.is_empty() {
            return;
        }
        for d in dispatches {
            let _ = self.output_tx.send(d.into());
        }
        let state = self.pipeline.state();
        self.state_tx.send_if_modified(|current| {
            if Arc::ptr_eq(current, &state) {
                false
            } else {
                *current = state.clone();
                true
            }
        });
    }
}
