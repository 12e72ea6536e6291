//! Error types for dashboard diffusion

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure category attached at the point a patch or intent is rejected.
///
/// VALIDATION and NOT_FOUND are soft: the offending operation is skipped and the
/// rest of the envelope still applies. BUDGET and PERMISSION are hard: the whole
/// envelope is discarded.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Budget,
    Permission,
    NotFound,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Validation,
        ErrorCategory::Budget,
        ErrorCategory::Permission,
        ErrorCategory::NotFound,
        ErrorCategory::Unknown,
    ];

    /// Hard errors abort the whole envelope with zero mutation.
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::Budget | Self::Permission)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Budget => "BUDGET",
            Self::Permission => "PERMISSION",
            Self::NotFound => "NOT_FOUND",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Keyword classification for free-text upstream error signals.
    ///
    /// Only used when an error arrives without a structured category; every
    /// error produced inside the pipeline carries its category directly.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| m.contains(w));

        if has(&["permission", "not allowed", "unauthorized", "forbidden"]) {
            Self::Permission
        } else if has(&["budget", "limit", "exceeded", "too many"]) {
            Self::Budget
        } else if has(&["validation", "schema", "invalid", "malformed"]) {
            Self::Validation
        } else if has(&["not found", "missing", "does not exist"]) {
            Self::NotFound
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized rejection of one operation, intent or envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct ApplyError {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ApplyError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            op_index: None,
            path: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Budget, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }

    /// Attach the position and path of the operation that failed.
    pub fn at(mut self, op_index: usize, path: impl Into<String>) -> Self {
        self.op_index = Some(op_index);
        self.path = Some(path.into());
        self
    }

    pub fn is_hard(&self) -> bool {
        self.category.is_hard()
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("rejected: {0}")]
    Rejected(#[from] ApplyError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Self::InvalidEvent(reason.into())
    }
}
