//! Stream protocol: events arriving from the reasoning producer
//!
//! Wire format (one JSON object per event):
//!
//!   { "type": "intent", "data": { "action": "show_panel", "panel": "map", "data": { ... } } }
//!   { "type": "patch",  "data": { "action": "patch", "ops": [ ... ], "batch_id": "b-1" } }
//!   { "type": "error",  "data": { "message": "upstream failed", "category": "UNKNOWN" } }
//!   { "type": "done" }
//!
//! Producers that skip the wrapper are also accepted: a bare object with `ops`
//! is a patch envelope, a bare object with `action` is an intent.

use crate::error::{ApplyError, Error, ErrorCategory, Result};
use crate::types::{Intent, PatchEnvelope, MAX_OPS_PER_ENVELOPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Out-of-band failure reported by the producer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorSignal {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl ErrorSignal {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    /// Structured category if present, keyword classification otherwise.
    pub fn resolved_category(&self) -> ErrorCategory {
        self.category
            .unwrap_or_else(|| ErrorCategory::classify(&self.message))
    }

    pub fn to_apply_error(&self) -> ApplyError {
        ApplyError::new(self.resolved_category(), self.message.clone())
    }
}

/// One event of the ordered upstream stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Intent(Intent),
    Patch(PatchEnvelope),
    Error(ErrorSignal),
    /// Terminal signal: flush whatever is pending.
    Done,
}

impl StreamEvent {
    /// Parse an event, accepting both wrapped and bare forms.
    pub fn from_value(value: Value) -> Result<Self> {
        let Some(obj) = value.as_object() else {
            return Err(Error::invalid_event("event must be a JSON object"));
        };

        if obj.contains_key("type") {
            return Ok(serde_json::from_value(value)?);
        }
        if obj.contains_key("ops") {
            return Ok(Self::Patch(serde_json::from_value(value)?));
        }
        if obj.contains_key("action") {
            return Ok(Self::Intent(serde_json::from_value(value)?));
        }
        Err(Error::invalid_event(
            "expected a `type`, `ops` or `action` field",
        ))
    }

    pub fn from_json(line: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(line)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Intent(_) => "intent",
            Self::Patch(_) => "patch",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }
}

/// Envelope-level shape checks performed before any operation is looked at.
pub fn validate_envelope_shape(envelope: &PatchEnvelope) -> std::result::Result<(), ApplyError> {
    if envelope.action != "patch" {
        return Err(ApplyError::validation(format!(
            "envelope action must be \"patch\", got \"{}\"",
            envelope.action
        )));
    }
    if envelope.ops.is_empty() {
        return Err(ApplyError::validation("ops list cannot be empty"));
    }
    if envelope.ops.len() > MAX_OPS_PER_ENVELOPE {
        return Err(ApplyError::validation(format!(
            "envelope carries {} ops (max {})",
            envelope.ops.len(),
            MAX_OPS_PER_ENVELOPE
        )));
    }
    Ok(())
}
