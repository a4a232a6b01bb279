//! Error types for the sync layer.
//!
//! Transport errors stay inside the tracker (a fallback always exists);
//! query and API errors are surfaced to callers.

use std::time::Duration;

use thiserror::Error;

/// Failure of a job-status transport. Never shown to view bindings: the
/// tracker reacts by advancing to the next strategy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("push channel connect failed: {0}")]
    Connect(String),

    #[error("push channel did not open within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no frame received within {0:?} of opening")]
    NoFirstFrame(Duration),

    #[error("push channel silent for {0:?}")]
    Stalled(Duration),

    #[error("push channel closed before a terminal status")]
    ClosedEarly,

    #[error("push channel interrupted: {0}")]
    Interrupted(String),
}

/// Outcome of a cache fetch that did not produce a value.
///
/// `Cancelled` is kept apart from `Failed` so callers can tell a superseded
/// or abandoned request from a real error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("fetch failed: {0}")]
    Failed(String),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("cached value for key '{0}' has a different type")]
    TypeMismatch(String),
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from the backend job endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// 404 from the status endpoint: the backend has no such job.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}
