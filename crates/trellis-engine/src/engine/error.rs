//! Engine-level error type.

use thiserror::Error;

use crate::compile::ValidationError;
use crate::errors::RunStoreError;

/// Errors surfaced by the [`Engine`](crate::Engine) API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph not found: {id}")]
    GraphNotFound { id: String },

    #[error("graph validation failed: {}", errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    InvalidGraph { errors: Vec<ValidationError> },

    #[error("unknown node key: {key}")]
    UnknownNode { key: String },

    #[error("node {key} is not awaiting user input")]
    NotWaiting { key: String },

    #[error("node {key} is not in a failed state")]
    NotRetryable { key: String },

    #[error(transparent)]
    Store(#[from] RunStoreError),
}

impl EngineError {
    /// True when the error is a rejected status transition — the signal an
    /// external caller delivered a duplicate or stale callback.
    pub fn is_stale_callback(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_illegal_transition())
    }
}
