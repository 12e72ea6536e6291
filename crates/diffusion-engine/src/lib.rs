//! diffusion-engine: validated, budget-bounded dashboard state from a producer stream
//!
//! Intents are batched and translated into patch envelopes, envelopes are
//! applied atomically against a working copy, and every outcome feeds a
//! circuit breaker that degrades the dashboard into safe mode when the
//! producer misbehaves.

pub mod batcher;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod ids;
pub mod path;
pub mod pipeline;
pub mod reducer;
pub mod registry;
pub mod schema;
pub mod session;
pub mod translate;

pub use batcher::{BatchFlush, IntentBatcher};
pub use breaker::{
    enter_safe_mode, BreakerStats, BreakerStatus, CircuitBreaker, ErrorRecord, HealthStatus,
};
pub use budget::BudgetTracker;
pub use config::{BatchConfig, BreakerConfig, BudgetConfig, BudgetLimits, DiffusionConfig, RegistryConfig};
pub use ids::{
    extract_content_key, generate_panel_id, generate_panel_id_from_data, matches_panel_id,
    panel_kind_from_id,
};
pub use path::{PanelField, PanelPath, PanelRef};
pub use pipeline::{Dispatch, Pipeline};
pub use reducer::{PatchReducer, PatchResult, RejectedOp};
pub use registry::{default_panel_specs, safe_mode_notice_spec, PanelSpec, Registry, CONTEXTS};
pub use schema::{validate_panel, validate_panel_data, validate_state};
pub use session::{DiffusionSession, SessionEvent, SessionHandle};
pub use translate::{IntentTranslator, Translation, TranslationContext};
