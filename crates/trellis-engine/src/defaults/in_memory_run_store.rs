//! In-memory run store for testing and lightweight usage.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::RunStoreError;
use crate::traits::RunStore;
use crate::transition;
use crate::types::{NodeKey, NodePatch, NodeState, Run};

/// In-memory implementation of [`RunStore`].
///
/// Uses `BTreeMap` for deterministic iteration order (project convention).
/// A single `RwLock` around the run map gives every patch the atomicity
/// the trait contract demands. Suitable for tests and short-lived
/// processes.
pub struct InMemoryRunStore {
    runs: Arc<RwLock<BTreeMap<String, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Check one patch against the stored state. `Pending` over `Pending` is a
/// legal re-seed so concurrent instance seeders converge; every other
/// repeated status is rejected, which is what makes duplicate fires and
/// duplicate callbacks lose their race.
fn check_patch(
    key: &NodeKey,
    current: Option<&NodeState>,
    patch: &NodePatch,
) -> Result<(), RunStoreError> {
    let Some(to) = patch.status else {
        return Ok(());
    };
    let from = match current {
        Some(state) => state.status,
        // Absent key: the patch creates it, and any initial status is
        // accepted (parallel instances are born Pending, not transitioned).
        None => return Ok(()),
    };
    if from == to && from == crate::types::NodeStatus::Pending {
        return Ok(());
    }
    transition::validate(from, to).map_err(|e| RunStoreError::IllegalTransition {
        key: key.as_str().to_string(),
        from: e.from,
        to: e.to,
    })
}

fn apply_patch(run: &mut Run, key: &NodeKey, patch: &NodePatch) -> NodeState {
    let state = run
        .node_states
        .entry(key.clone())
        .or_insert_with(NodeState::pending);
    patch.apply(state);
    state.clone()
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().await;
        runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, RunStoreError> {
        let runs = self.runs.read().await;
        runs.get(run_id).cloned().ok_or(RunStoreError::NotFound {
            id: run_id.to_string(),
        })
    }

    async fn patch_node(
        &self,
        run_id: &str,
        key: &NodeKey,
        patch: NodePatch,
    ) -> Result<NodeState, RunStoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(run_id).ok_or(RunStoreError::NotFound {
            id: run_id.to_string(),
        })?;
        check_patch(key, run.node_states.get(key), &patch)?;
        Ok(apply_patch(run, key, &patch))
    }

    async fn patch_many(
        &self,
        run_id: &str,
        patches: Vec<(NodeKey, NodePatch)>,
    ) -> Result<(), RunStoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(run_id).ok_or(RunStoreError::NotFound {
            id: run_id.to_string(),
        })?;

        // Validate every patch against the pre-write snapshot first so a
        // rejected batch leaves no partial writes behind.
        for (key, patch) in &patches {
            check_patch(key, run.node_states.get(key), patch)?;
        }
        for (key, patch) in &patches {
            apply_patch(run, key, patch);
        }
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<String>, RunStoreError> {
        let runs = self.runs.read().await;
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, String)> = runs
            .values()
            .map(|r| (r.created_at, r.run_id.clone()))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;
    use serde_json::json;

    fn seeded_run() -> Run {
        let ids = vec!["a".to_string(), "b".to_string()];
        Run::new("g1", "1", ids.iter(), serde_json::json!({}), None)
    }

    #[tokio::test]
    async fn patch_creates_and_transitions() {
        let store = InMemoryRunStore::new();
        let run = seeded_run();
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        let state = store
            .patch_node(&run_id, &NodeKey::new("a"), NodePatch::running())
            .await
            .unwrap();
        assert_eq!(state.status, NodeStatus::Running);

        let state = store
            .patch_node(&run_id, &NodeKey::new("a"), NodePatch::completed(json!(1)))
            .await
            .unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.output, Some(json!(1)));
    }

    #[tokio::test]
    async fn illegal_transition_rejected_and_state_unchanged() {
        let store = InMemoryRunStore::new();
        let run = seeded_run();
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        // Pending -> Completed skips Running.
        let err = store
            .patch_node(&run_id, &NodeKey::new("a"), NodePatch::completed(json!(1)))
            .await
            .unwrap_err();
        assert!(err.is_illegal_transition());

        let run = store.get_run(&run_id).await.unwrap();
        let state = run.state(&NodeKey::new("a")).unwrap();
        assert_eq!(state.status, NodeStatus::Pending);
        assert!(state.output.is_none());
    }

    #[tokio::test]
    async fn duplicate_fire_loses_the_race() {
        let store = InMemoryRunStore::new();
        let run = seeded_run();
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        let key = NodeKey::new("a");
        store
            .patch_node(&run_id, &key, NodePatch::running())
            .await
            .unwrap();
        // Second fire of the same node: Running -> Running is rejected, so
        // only one invocation dispatches work.
        let err = store
            .patch_node(&run_id, &key, NodePatch::running())
            .await
            .unwrap_err();
        assert!(err.is_illegal_transition());

        store
            .patch_node(&run_id, &key, NodePatch::completed(json!(1)))
            .await
            .unwrap();
        // A late duplicate callback now loses.
        let err = store
            .patch_node(&run_id, &key, NodePatch::completed(json!(2)))
            .await
            .unwrap_err();
        assert!(err.is_illegal_transition());
        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.state(&key).unwrap().output, Some(json!(1)));
    }

    #[tokio::test]
    async fn patch_many_is_all_or_nothing() {
        let store = InMemoryRunStore::new();
        let run = seeded_run();
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        // Second patch is illegal (b: Pending -> Completed), so a's legal
        // patch must not land either.
        let err = store
            .patch_many(
                &run_id,
                vec![
                    (NodeKey::new("a"), NodePatch::running()),
                    (NodeKey::new("b"), NodePatch::completed(json!(1))),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_illegal_transition());

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.status_of(&NodeKey::new("a")), Some(NodeStatus::Pending));
        assert_eq!(run.status_of(&NodeKey::new("b")), Some(NodeStatus::Pending));
    }

    #[tokio::test]
    async fn patch_many_seeds_new_instance_keys() {
        let store = InMemoryRunStore::new();
        let run = seeded_run();
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        let patches = (0..3)
            .map(|i| {
                let mut p = NodePatch::default();
                p.status = Some(NodeStatus::Pending);
                p.output = Some(json!(i * 10));
                (NodeKey::augmented("b", i), p)
            })
            .collect();
        store.patch_many(&run_id, patches).await.unwrap();

        let run = store.get_run(&run_id).await.unwrap();
        let instances = run.instances_of("b");
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[2].1.output, Some(json!(20)));
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let err = store.get_run("nope").await.unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_completions_each_land_once() {
        let store = Arc::new(InMemoryRunStore::new());
        let ids: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
        let run = Run::new("g1", "1", ids.iter(), serde_json::json!({}), None);
        let run_id = run.run_id.clone();
        store.create_run(run).await.unwrap();

        let mut handles = Vec::new();
        for id in &ids {
            let store = Arc::clone(&store);
            let run_id = run_id.clone();
            let key = NodeKey::new(id.clone());
            handles.push(tokio::spawn(async move {
                store
                    .patch_node(&run_id, &key, NodePatch::running())
                    .await
                    .unwrap();
                store
                    .patch_node(&run_id, &key, NodePatch::completed(json!("done")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let run = store.get_run(&run_id).await.unwrap();
        assert!(run
            .node_states
            .values()
            .all(|s| s.status == NodeStatus::Completed));
    }
}
