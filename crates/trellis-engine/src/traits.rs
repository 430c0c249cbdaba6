//! Plugin trait interfaces for the engine.
//!
//! Every pluggable component is defined as an async trait. In-memory
//! default implementations live in `defaults/`. Adding a method to any
//! trait requires a default implementation to preserve backward
//! compatibility.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{DispatchError, RunStoreError, WorkerError};
use crate::types::{NodeKey, NodePatch, NodeState, Run, WorkerDispatch};

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

/// Durable persistence for run state. The single source of truth the
/// engine re-derives everything from — no execution decision may depend
/// on state held only in memory.
///
/// # Contract
/// Implementations must validate the status state machine at the write
/// point: a patch whose `status` is not a legal transition from the
/// stored status fails with [`RunStoreError::IllegalTransition`] and
/// leaves the run untouched. A `Pending` patch over an already `Pending`
/// key is a legal no-op (concurrent instance seeders converge); every
/// other repeated status loses its race.
/// `patch_many` is all-or-nothing: every patch is validated against the
/// pre-write snapshot before any is applied.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<(), RunStoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, RunStoreError>;

    /// Apply one patch to one node key, creating the key if absent.
    /// Returns the post-patch state.
    async fn patch_node(
        &self,
        run_id: &str,
        key: &NodeKey,
        patch: NodePatch,
    ) -> Result<NodeState, RunStoreError>;

    /// Apply a set of patches atomically. All-or-nothing: if any patch
    /// is an illegal transition, none are applied.
    async fn patch_many(
        &self,
        run_id: &str,
        patches: Vec<(NodeKey, NodePatch)>,
    ) -> Result<(), RunStoreError>;

    /// List run ids, newest first. Default: empty (override for stores
    /// that support enumeration).
    async fn list_runs(&self) -> Result<Vec<String>, RunStoreError> {
        Ok(vec![])
    }
}

// ---------------------------------------------------------------------------
// WorkerDelegate
// ---------------------------------------------------------------------------

/// An in-process worker implementation, registered by `worker_type`.
///
/// When a worker node fires and its type has a registered delegate, the
/// engine invokes it inline instead of dispatching externally, and
/// completes (or fails) the node with the result. Delegates must be
/// idempotent with respect to re-invocation after a retry.
#[async_trait]
pub trait WorkerDelegate: Send + Sync {
    /// Execute the worker. `input` is the merged upstream payload,
    /// `config` the static node config from the graph.
    async fn execute(&self, input: &Value, config: &Value) -> Result<Value, WorkerError>;
}

// ---------------------------------------------------------------------------
// WorkerDispatcher
// ---------------------------------------------------------------------------

/// Delivery of work to external workers.
///
/// Dispatch is fire-and-forget: the node stays `Running` until the
/// external worker reports back through the engine's callback surface.
/// A dispatch error fails the node immediately.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, dispatch: &WorkerDispatch) -> Result<(), DispatchError>;
}

/// Dispatcher that logs and drops every dispatch. Useful for tests and
/// for deployments where all workers are in-process delegates.
pub struct NoopDispatcher;

#[async_trait]
impl WorkerDispatcher for NoopDispatcher {
    async fn dispatch(&self, dispatch: &WorkerDispatch) -> Result<(), DispatchError> {
        tracing::debug!(
            run_id = %dispatch.run_id,
            node_id = %dispatch.node_id,
            "noop dispatcher dropping work"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EntityTracker
// ---------------------------------------------------------------------------

/// Notification hook for the business entity a run belongs to.
///
/// Called on run lifecycle boundaries so an owning record (order,
/// ticket, document) can mirror the run's progress. Never authoritative;
/// failures are logged and do not affect the run.
#[async_trait]
pub trait EntityTracker: Send + Sync {
    async fn run_started(&self, entity_ref: &str, run_id: &str);

    async fn run_finished(&self, entity_ref: &str, run_id: &str, outcome: RunOutcome);
}

/// Terminal disposition reported to the entity tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Entity tracker that discards all notifications.
pub struct NoopEntityTracker;

#[async_trait]
impl EntityTracker for NoopEntityTracker {
    async fn run_started(&self, _entity_ref: &str, _run_id: &str) {}
    async fn run_finished(&self, _entity_ref: &str, _run_id: &str, _outcome: RunOutcome) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_dispatcher_accepts_work() {
        let d = NoopDispatcher;
        let dispatch = WorkerDispatch {
            run_id: "run-1".into(),
            node_id: "w1".into(),
            config: serde_json::json!({}),
            input: serde_json::json!({"x": 1}),
            callback_url: "http://localhost/cb".into(),
        };
        assert!(d.dispatch(&dispatch).await.is_ok());
    }

    #[tokio::test]
    async fn noop_tracker_is_silent() {
        let t = NoopEntityTracker;
        t.run_started("order-1", "run-1").await;
        t.run_finished("order-1", "run-1", RunOutcome::Completed)
            .await;
    }
}
