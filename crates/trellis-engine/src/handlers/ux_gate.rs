//! UX gate handler: parks a branch until a human resumes it.

use crate::compile::ExecutionGraph;
use crate::engine::{EngineError, EngineInner};
use crate::types::{NodeKey, NodePatch, NodeStatus};

impl EngineInner {
    pub(crate) async fn fire_ux_gate(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
    ) -> Result<(), EngineError> {
        let Some(_input) = self.claim(graph, run_id, key).await? else {
            return Ok(());
        };
        self.park_gate(run_id, key).await
    }

    /// `Running -> WaitingForUser`. The captured input stays on the state
    /// so the eventual resume can merge the user's payload over it.
    pub(crate) async fn park_gate(&self, run_id: &str, key: &NodeKey) -> Result<(), EngineError> {
        let patch = NodePatch {
            status: Some(NodeStatus::WaitingForUser),
            ..NodePatch::default()
        };
        self.store.patch_node(run_id, key, patch).await?;
        tracing::info!(run_id, key = %key, "gate awaiting user input");
        Ok(())
    }
}
