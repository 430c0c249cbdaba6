//! Error types for the engine's trait boundaries.

use thiserror::Error;

use crate::types::NodeStatus;

/// Errors from [`RunStore`](crate::traits::RunStore).
#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("run not found: {id}")]
    NotFound { id: String },
    /// A patch requested a status change absent from the transition table.
    /// Rejected at the store boundary; the targeted state is left unchanged.
    #[error("illegal transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: String,
        from: NodeStatus,
        to: NodeStatus,
    },
    #[error("run store error: {message}")]
    Store { message: String },
}

impl RunStoreError {
    /// True when this is the benign loser of a fire/complete race: another
    /// invocation applied the same logical transition first.
    pub fn is_illegal_transition(&self) -> bool {
        matches!(self, Self::IllegalTransition { .. })
    }
}

/// Errors reaching an external worker delegate. Dispatch failures convert
/// synchronously to node `Failed` — the engine cannot wait for a callback
/// that will never arrive.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker delegate unreachable: {message}")]
    Unreachable { message: String },
    #[error("worker config invalid: {message}")]
    Config { message: String },
}

/// Failure reported by an in-process worker delegate.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for WorkerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for WorkerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
