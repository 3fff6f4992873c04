//! Typed error hierarchy for the storyforge orchestrator.
//!
//! Two enums cover the layers that need matchable errors:
//! - `ModelError` — upstream model call failures, split transient/permanent
//! - `GateError` — JSON-shaped response failures at the decoder boundary
//!
//! Orchestration plumbing above these layers uses `anyhow` with context,
//! and the step-retry wrapper classifies by rendered message.

use thiserror::Error;

/// Errors from the upstream language-model client.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Retryable upstream condition: rate limit, overload, timeout, reset.
    #[error("Transient upstream error: {message}")]
    Transient { message: String },

    /// Non-retryable failure: semantic 4xx, auth, malformed request.
    #[error("Permanent upstream error: {message}")]
    Permanent { message: String },
}

impl ModelError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// True when the retry loop (and the health sweeper) may try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

/// Errors from the JSON gate that validates model output shape.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("No JSON object found in model response")]
    NoJson,

    #[error("Failed to parse model JSON after repair: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Model JSON missing required field '{field}'")]
    MissingField { field: String },
}
