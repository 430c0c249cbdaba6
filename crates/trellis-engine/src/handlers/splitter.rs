//! Splitter handler: array fan-out into per-element parallel instances.

use serde_json::Value;

use crate::compile::ExecutionGraph;
use crate::engine::walker::{resolve_path, upstream_satisfied};
use crate::engine::{EngineError, EngineInner};
use crate::types::{NodeKey, NodeKind, NodePatch, NodeStatus};

impl EngineInner {
    pub(crate) async fn fire_splitter(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
    ) -> Result<(), EngineError> {
        let Some(input) = self.claim(graph, run_id, key).await? else {
            return Ok(());
        };
        self.split_and_seed(graph, run_id, key, input).await
    }

    /// Extract the fan-out array, seed one Pending instance per element
    /// for every parallel consumer, complete the splitter, then fire the
    /// instances. Seeding and splitter completion land in one atomic
    /// batch: a reader never observes a completed splitter with a
    /// partially seeded fan-out.
    pub(crate) async fn split_and_seed(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
        input: Value,
    ) -> Result<(), EngineError> {
        let base = graph.base_id(key).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        let spec = graph.spec(base).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;

        let path = spec.array_path.as_deref().unwrap_or("");
        let elements = match resolve_path(&input, path) {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return self
                    .fail_key(
                        graph,
                        run_id,
                        key,
                        &format!("array_path `{path}` did not resolve to an array"),
                    )
                    .await;
            }
        };
        tracing::debug!(run_id, key = %key, branches = elements.len(), "splitting");

        let mut patches: Vec<(NodeKey, NodePatch)> = Vec::new();
        for target in graph.downstream(base) {
            if is_collector(graph, target) {
                continue;
            }
            for (i, element) in elements.iter().enumerate() {
                let seed = NodePatch {
                    status: Some(NodeStatus::Pending),
                    output: Some(element.clone()),
                    ..NodePatch::default()
                };
                patches.push((NodeKey::augmented(target, i), seed));
            }
        }
        patches.push((
            key.clone(),
            NodePatch::completed(Value::Array(elements.clone())),
        ));
        self.store.patch_many(run_id, patches).await?;

        for target in graph.downstream(base) {
            if is_collector(graph, target) {
                self.fire_collector(graph, run_id, target).await?;
            } else if elements.is_empty() {
                self.complete_vacuous_consumer(graph, run_id, target).await?;
            } else {
                for i in 0..elements.len() {
                    self.fire(graph, run_id, &NodeKey::augmented(target, i))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// An empty split leaves a parallel consumer with zero instances, so
    /// nothing will ever fire it. Mark it completed with an empty result
    /// and walk through so downstream collectors learn about it. Safe to
    /// call again: a repeat loses the `Pending -> Running` transition and
    /// backs off.
    pub(crate) async fn complete_vacuous_consumer(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        target: &str,
    ) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        if !upstream_satisfied(graph, &run, target) {
            return Ok(());
        }
        let target_key = NodeKey::new(target);
        match self
            .store
            .patch_node(run_id, &target_key, NodePatch::running())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_illegal_transition() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.store
            .patch_node(
                run_id,
                &target_key,
                NodePatch::completed(Value::Array(vec![])),
            )
            .await?;
        self.walk_from(graph, run_id, &target_key).await
    }
}

fn is_collector(graph: &ExecutionGraph, id: &str) -> bool {
    matches!(
        graph.spec(id).map(|s| s.kind),
        Some(NodeKind::Collector)
    )
}
