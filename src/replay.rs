//! Replay a recorded event stream through a live session

use anyhow::Context;
use diffusion_core::{DashboardState, RunMode, StreamEvent};
use diffusion_engine::{
    BudgetTracker, DiffusionConfig, DiffusionSession, HealthStatus, Pipeline, SessionEvent,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub struct ReplayOptions {
    pub context: String,
    pub mode: RunMode,
    pub config: DiffusionConfig,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            context: "dm".to_string(),
            mode: RunMode::Stable,
            config: DiffusionConfig::default(),
        }
    }
}

/// Counts of what the session emitted while replaying.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub committed: usize,
    pub rejected: usize,
    pub soft_rejected_ops: usize,
    pub intent_errors: usize,
    pub upstream_errors: usize,
    pub refused: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_mode_reason: Option<String>,
}

impl Tally {
    fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateUpdated { rejected, .. } => {
                self.committed += 1;
                self.soft_rejected_ops += rejected;
            }
            SessionEvent::EnvelopeRejected { .. } => self.rejected += 1,
            SessionEvent::IntentsRejected { errors } => self.intent_errors += errors.len(),
            SessionEvent::UpstreamError { .. } => self.upstream_errors += 1,
            SessionEvent::Refused { .. } => self.refused += 1,
            SessionEvent::SafeModeEntered { reason, .. } => {
                self.safe_mode_reason = Some(reason.clone());
            }
            SessionEvent::Finished { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub events: usize,
    pub mode: RunMode,
    pub tally: Tally,
    pub budget: BudgetTracker,
    pub health: HealthStatus,
    pub state: DashboardState,
}

/// Feed `events` to a fresh session in order and wait for it to finish.
pub async fn replay(events: Vec<StreamEvent>, opts: &ReplayOptions) -> anyhow::Result<ReplayReport> {
    let pipeline = Pipeline::from_config(&opts.config, opts.context.clone(), opts.mode);
    let (session, handle) = DiffusionSession::new(pipeline);

    let mut rx = handle.subscribe();
    let collector = tokio::spawn(async move {
        let mut tally = Tally::default();
        loop {
            match rx.recv().await {
                Ok(event) => tally.observe(&event),
                Err(RecvError::Lagged(n)) => warn!("replay collector lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
        tally
    });
    let runner = tokio::spawn(session.run());

    let count = events.len();
    info!("Replaying {} events (context={}, mode={})", count, opts.context, opts.mode);
    for event in events {
        if let Err(e) = handle.send(event).await {
            warn!("Session stopped before the stream ended: {}", e);
            break;
        }
    }
    drop(handle);

    let pipeline = runner.await.context("session task failed")?;
    let tally = collector.await.context("collector task failed")?;

    Ok(ReplayReport {
        events: count,
        mode: pipeline.mode(),
        tally,
        budget: pipeline.budget().clone(),
        health: pipeline.health(),
        state: DashboardState::clone(&pipeline.state()),
    })
}
