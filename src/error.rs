use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single action. Everything except `Cancelled` is reported back
/// to the model as an error-tagged result instead of ending the run.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    #[error("malformed action: {0}")]
    MalformedAction(String),
    #[error("coordinates ({x}, {y}) outside display bounds ({width}x{height})")]
    OutOfBounds { x: i64, y: i64, width: u32, height: u32 },
    #[error("{what} timed out after {after_ms}ms")]
    Timeout { what: String, after_ms: u64 },
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("service failure: {0}")]
    ServiceFailure(String),
    #[error("cancelled")]
    Cancelled,
    #[error("declined by operator")]
    Declined,
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl ActionError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        ActionError::Timeout { what: what.into(), after_ms: after.as_millis() as u64 }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        ActionError::MalformedAction(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ActionError::Timeout { .. })
    }
}

/// Why a run ended without completing its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ModelUnreachable,
    Timeout,
    Cancelled,
    OperatorUnavailable,
    HistoryCorrupted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::ModelUnreachable => "model_unreachable",
            AbortReason::Timeout => "timeout",
            AbortReason::Cancelled => "cancelled",
            AbortReason::OperatorUnavailable => "operator_unavailable",
            AbortReason::HistoryCorrupted => "history_corrupted",
        };
        f.write_str(s)
    }
}
