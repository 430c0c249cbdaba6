//! Collector handler: fan-in of parallel branch outputs.
//!
//! A collector is fired on every upstream completion and re-derives its
//! readiness from the durable per-key statuses each time — never from a
//! maintained counter. Whichever concurrent invocation first lands the
//! terminal patch wins; every other invocation derives the same answer
//! from the same durable state and loses the race benignly.

use serde_json::Value;

use crate::compile::ExecutionGraph;
use crate::engine::{EngineError, EngineInner};
use crate::types::{NodeKey, NodePatch, NodeStatus};

/// What one derivation pass over the upstream state concluded.
enum Derivation {
    /// At least one dependency has not reached a terminal status yet.
    NotReady,
    /// Every branch completed; outputs in declaration-then-split order.
    Complete(Vec<Value>),
    /// A branch failed; fail fast with its error.
    Failed(String),
}

impl EngineInner {
    pub(crate) async fn fire_collector(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        id: &str,
    ) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        let key = NodeKey::new(id);
        if matches!(
            run.status_of(&key),
            Some(NodeStatus::Completed) | Some(NodeStatus::Failed)
        ) {
            return Ok(());
        }

        let derived = derive(graph, &run, id);
        let collected = match derived {
            Derivation::NotReady => return Ok(()),
            Derivation::Failed(message) => {
                // Fail-fast still has to pass through Running first.
                if let Err(e) = self.store.patch_node(run_id, &key, NodePatch::running()).await {
                    if !e.is_illegal_transition() {
                        return Err(e.into());
                    }
                }
                return self.fail_key(graph, run_id, &key, &message).await;
            }
            Derivation::Complete(collected) => collected,
        };

        // Claim with advisory counters. A lost claim means a concurrent
        // invocation is mid-derivation over the same durable state; keep
        // going and let the terminal patch pick the single winner.
        let claim = NodePatch {
            expected_upstream: Some(collected.len() as u32),
            upstream_completed: Some(collected.len() as u32),
            ..NodePatch::running()
        };
        if let Err(e) = self.store.patch_node(run_id, &key, claim).await {
            if !e.is_illegal_transition() {
                return Err(e.into());
            }
        }

        match self
            .store
            .patch_node(run_id, &key, NodePatch::completed(Value::Array(collected)))
            .await
        {
            Ok(state) => {
                tracing::debug!(
                    run_id,
                    key = %key,
                    branches = state.expected_upstream.unwrap_or(0),
                    "collector completed"
                );
                self.walk_from(graph, run_id, &key).await
            }
            Err(e) if e.is_illegal_transition() => {
                tracing::debug!(run_id, key = %key, "collector completion lost its race");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Re-derive the collector's view of its upstream dependencies.
///
/// A parallel upstream contributes its instance outputs in split order
/// once its seeding splitter completed — zero instances (empty split)
/// contribute nothing and still count as done. A static upstream
/// contributes its single output.
fn derive(graph: &ExecutionGraph, run: &crate::types::Run, id: &str) -> Derivation {
    let mut collected = Vec::new();
    for u in graph.upstream_of(id) {
        if let Some(splitter) = graph.seeding_splitter(u) {
            if run.status_of(&NodeKey::new(splitter)) != Some(NodeStatus::Completed) {
                return Derivation::NotReady;
            }
            for (ikey, istate) in run.instances_of(u) {
                match istate.status {
                    NodeStatus::Completed => {
                        collected.push(istate.output.clone().unwrap_or(Value::Null));
                    }
                    NodeStatus::Failed => {
                        return Derivation::Failed(format!(
                            "upstream branch {ikey} failed: {}",
                            istate.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                    _ => return Derivation::NotReady,
                }
            }
        } else {
            let Some(state) = run.state(&NodeKey::new(u)) else {
                return Derivation::NotReady;
            };
            match state.status {
                NodeStatus::Completed => {
                    collected.push(state.output.clone().unwrap_or(Value::Null));
                }
                NodeStatus::Failed => {
                    return Derivation::Failed(format!(
                        "upstream {u} failed: {}",
                        state.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                _ => return Derivation::NotReady,
            }
        }
    }
    Derivation::Complete(collected)
}
