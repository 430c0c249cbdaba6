//! Worker handler: in-process delegate execution or external dispatch.

use serde_json::Value;

use crate::compile::ExecutionGraph;
use crate::engine::{EngineError, EngineInner};
use crate::types::{NodeKey, NodePatch, NodeSpec, WorkerDispatch};

impl EngineInner {
    pub(crate) async fn fire_worker(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
    ) -> Result<(), EngineError> {
        let base = graph.base_id(key).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        let spec = graph.spec(base).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        let Some(input) = self.claim(graph, run_id, key).await? else {
            return Ok(());
        };
        self.dispatch_worker(graph, run_id, key, spec, input).await
    }

    /// Run the worker body for an already-`Running` node. Shared by the
    /// fire path and retries, which re-enter here with the stored input.
    pub(crate) async fn dispatch_worker(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
        spec: &NodeSpec,
        input: Value,
    ) -> Result<(), EngineError> {
        let worker_type = spec.worker_type.as_deref().unwrap_or_default();

        if let Some(delegate) = self.workers.get(worker_type) {
            match delegate.execute(&input, &spec.config).await {
                Ok(output) => {
                    match self
                        .store
                        .patch_node(run_id, key, NodePatch::completed(output))
                        .await
                    {
                        Ok(_) => {}
                        Err(e) if e.is_illegal_transition() => {
                            tracing::debug!(run_id, key = %key, "completion lost its race");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                    tracing::debug!(run_id, key = %key, worker_type, "delegate completed");
                    self.walk_from(graph, run_id, key).await
                }
                Err(e) => self.fail_key(graph, run_id, key, &e.message).await,
            }
        } else {
            let dispatch = WorkerDispatch {
                run_id: run_id.to_string(),
                node_id: key.to_string(),
                config: spec.config.clone(),
                input,
                callback_url: self.callback_url(run_id, key),
            };
            match self.dispatcher.dispatch(&dispatch).await {
                Ok(()) => {
                    tracing::debug!(run_id, key = %key, worker_type, "dispatched to external worker");
                    Ok(())
                }
                // No callback will ever arrive for a failed dispatch.
                Err(e) => self.fail_key(graph, run_id, key, &e.to_string()).await,
            }
        }
    }

    pub(crate) fn callback_url(&self, run_id: &str, key: &NodeKey) -> String {
        format!(
            "{}/runs/{}/nodes/{}/callback",
            self.config.callback_base_url.trim_end_matches('/'),
            run_id,
            key
        )
    }
}
