//! Edge walking: the recursive traversal that advances a run.
//!
//! `walk_from(key)` is invoked every time a node completes. It looks at
//! the completed node's downstream edges, fires every target whose
//! dependencies are now satisfied, and recurses through whatever those
//! targets complete synchronously. Concurrent walks over the same region
//! are resolved entirely by the store's transition validation: the loser
//! of a `Pending -> Running` claim backs off silently.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};

use super::{EngineError, EngineInner};
use crate::compile::ExecutionGraph;
use crate::types::{NodeKey, NodeKind, NodeStatus, Run};

impl EngineInner {
    /// Advance the run past a just-completed `key`.
    ///
    /// Boxed because the walk is mutually recursive with the node
    /// handlers (a synchronous completion keeps walking).
    pub(crate) fn walk_from<'a>(
        &'a self,
        graph: &'a ExecutionGraph,
        run_id: &'a str,
        key: &'a NodeKey,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            let base = graph.base_id(key).ok_or_else(|| EngineError::UnknownNode {
                key: key.to_string(),
            })?;
            let run = self.store.get_run(run_id).await?;

            for target in graph.downstream(base) {
                let target_kind = match graph.spec(target) {
                    Some(spec) => spec.kind,
                    None => continue,
                };
                match target_kind {
                    // Collectors are fired on every upstream completion and
                    // re-derive their own readiness from durable state.
                    NodeKind::Collector => {
                        self.fire_collector(graph, run_id, target).await?;
                    }
                    _ if graph.seeding_splitter(target).is_some() => {
                        // Parallel consumers are fired per-instance by the
                        // splitter handler, never by the dependency gate. An
                        // empty split leaves no instances; close the branch
                        // out as vacuously done.
                        if run.instances_of(target).is_empty()
                            && run.status_of(&NodeKey::new(target)) == Some(NodeStatus::Pending)
                        {
                            self.complete_vacuous_consumer(graph, run_id, target)
                                .await?;
                        }
                    }
                    _ => {
                        if upstream_satisfied(graph, &run, target) {
                            self.fire(graph, run_id, &NodeKey::new(target.clone()))
                                .await?;
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Fire a node by kind. Safe to call speculatively: each handler
    /// claims `Pending -> Running` first and backs off if it loses.
    pub(crate) fn fire<'a>(
        &'a self,
        graph: &'a ExecutionGraph,
        run_id: &'a str,
        key: &'a NodeKey,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            let base = graph.base_id(key).ok_or_else(|| EngineError::UnknownNode {
                key: key.to_string(),
            })?;
            let kind = graph
                .spec(base)
                .map(|s| s.kind)
                .ok_or_else(|| EngineError::UnknownNode {
                    key: key.to_string(),
                })?;
            match kind {
                NodeKind::Worker => self.fire_worker(graph, run_id, key).await,
                NodeKind::Splitter => self.fire_splitter(graph, run_id, key).await,
                NodeKind::Collector => {
                    let base = base.to_string();
                    self.fire_collector(graph, run_id, &base).await
                }
                NodeKind::UxGate => self.fire_ux_gate(graph, run_id, key).await,
            }
        }
        .boxed()
    }

    /// Claim `Pending -> Running`, recording the merged input. Returns the
    /// input on success, `None` when another invocation won the race.
    pub(crate) async fn claim(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
    ) -> Result<Option<Value>, EngineError> {
        let run = self.store.get_run(run_id).await?;
        let base = graph.base_id(key).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        let input = input_for(graph, &run, base, key);
        let patch = crate::types::NodePatch::running().with_input(input.clone());
        match self.store.patch_node(run_id, key, patch).await {
            Ok(_) => Ok(Some(input)),
            Err(e) if e.is_illegal_transition() => {
                tracing::debug!(run_id, key = %key, "fire race lost, backing off");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a node failed and report the run as failed. Losing the
    /// transition race here is benign — someone else already decided the
    /// node's fate.
    ///
    /// Boxed: waking downstream collectors re-enters `fire_collector`,
    /// whose own fail-fast path lands back here.
    pub(crate) fn fail_key<'a>(
        &'a self,
        graph: &'a ExecutionGraph,
        run_id: &'a str,
        key: &'a NodeKey,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            match self
                .store
                .patch_node(run_id, key, crate::types::NodePatch::failed(message))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_illegal_transition() => {
                    tracing::debug!(run_id, key = %key, "failure patch lost its race");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            tracing::warn!(run_id, key = %key, error = message, "node failed");
            self.notify_finished(run_id, crate::traits::RunOutcome::Failed)
                .await;
            self.fire_downstream_collectors(graph, run_id, key).await
        }
        .boxed()
    }

    /// Wake every collector downstream of a just-failed node. A failed
    /// branch never completes, so fail-fast cannot wait for a sibling
    /// completion to trigger the next derivation — the failure itself is
    /// the last event the collector will ever see.
    pub(crate) async fn fire_downstream_collectors(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
        key: &NodeKey,
    ) -> Result<(), EngineError> {
        let Some(base) = graph.base_id(key) else {
            return Ok(());
        };
        for target in graph.downstream(base) {
            if matches!(
                graph.spec(target).map(|s| s.kind),
                Some(NodeKind::Collector)
            ) {
                self.fire_collector(graph, run_id, target).await?;
            }
        }
        Ok(())
    }

    /// Report run completion once every terminal node is satisfied.
    pub(crate) async fn check_run_completion(
        &self,
        graph: &ExecutionGraph,
        run_id: &str,
    ) -> Result<(), EngineError> {
        let run = self.store.get_run(run_id).await?;
        let done = graph
            .terminal_nodes
            .iter()
            .all(|t| node_satisfied(graph, &run, t));
        if done {
            tracing::info!(run_id, "run completed");
            self.notify_finished(run_id, crate::traits::RunOutcome::Completed)
                .await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Whether every upstream dependency of `id` has delivered its output.
pub(crate) fn upstream_satisfied(graph: &ExecutionGraph, run: &Run, id: &str) -> bool {
    graph
        .upstream_of(id)
        .iter()
        .all(|u| node_satisfied(graph, run, u))
}

/// Whether `id` counts as delivered from a consumer's point of view.
///
/// A parallel consumer is delivered when its seeding splitter completed
/// and every instance completed — including the zero-instance case of an
/// empty split. Everything else is delivered when simply `Completed`.
pub(crate) fn node_satisfied(graph: &ExecutionGraph, run: &Run, id: &str) -> bool {
    if let Some(splitter) = graph.seeding_splitter(id) {
        let splitter_done =
            run.status_of(&NodeKey::new(splitter)) == Some(NodeStatus::Completed);
        splitter_done
            && run
                .instances_of(id)
                .iter()
                .all(|(_, s)| s.status == NodeStatus::Completed)
    } else {
        run.status_of(&NodeKey::new(id)) == Some(NodeStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// Input assembly
// ---------------------------------------------------------------------------

/// Resolve the input a node sees when it fires.
///
/// Instance keys read their seeded split element (remapped through the
/// splitter edge); static keys merge their upstream contributions.
pub(crate) fn input_for(graph: &ExecutionGraph, run: &Run, base: &str, key: &NodeKey) -> Value {
    if key.as_str() != base {
        let element = run
            .state(key)
            .and_then(|s| s.output.clone())
            .unwrap_or(Value::Null);
        let map = graph
            .seeding_splitter(base)
            .and_then(|s| graph.edge_map(s, base));
        let defaults = defaults_of(graph, base);
        return shape_contribution(defaults, element, map);
    }
    merged_input(graph, run, base)
}

/// Merged input for a static node: defaults underneath, then each upstream
/// contribution in edge declaration order, last writer winning.
pub(crate) fn merged_input(graph: &ExecutionGraph, run: &Run, base: &str) -> Value {
    let defaults = defaults_of(graph, base);
    let upstream = graph.upstream_of(base);

    // Entry nodes consume the run's trigger inputs.
    if upstream.is_empty() {
        return shape_contribution(defaults, run.inputs.clone(), None);
    }

    let mut acc = defaults;
    for u in upstream {
        let contribution = contribution_of(graph, run, u);
        match graph.edge_map(u, base) {
            Some(map) => {
                for (field, path) in map {
                    let value = resolve_path(&contribution, path)
                        .cloned()
                        .unwrap_or(Value::Null);
                    acc.insert(field.clone(), value);
                }
            }
            None => match contribution {
                Value::Object(obj) => {
                    for (k, v) in obj {
                        acc.insert(k, v);
                    }
                }
                // Non-object with no mapping: keyed by the upstream id so
                // nothing is silently dropped.
                other => {
                    acc.insert(u.clone(), other);
                }
            },
        }
    }
    Value::Object(acc)
}

/// What `u` hands downstream: a parallel consumer contributes its
/// suffix-ordered instance outputs as one array (implicit fan-in), anyone
/// else contributes their completed output.
fn contribution_of(graph: &ExecutionGraph, run: &Run, u: &str) -> Value {
    if graph.seeding_splitter(u).is_some() {
        Value::Array(
            run.instances_of(u)
                .into_iter()
                .map(|(_, s)| s.output.clone().unwrap_or(Value::Null))
                .collect(),
        )
    } else {
        run.state(&NodeKey::new(u))
            .and_then(|s| s.output.clone())
            .unwrap_or(Value::Null)
    }
}

fn defaults_of(graph: &ExecutionGraph, base: &str) -> Map<String, Value> {
    graph
        .spec(base)
        .map(|spec| {
            spec.defaults
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Shape a single contribution over a defaults base. With a field map,
/// each mapped path is extracted; without one, objects shallow-merge and
/// a bare scalar passes through untouched when there is nothing to merge
/// it with.
fn shape_contribution(
    mut acc: Map<String, Value>,
    contribution: Value,
    map: Option<&std::collections::BTreeMap<String, String>>,
) -> Value {
    match map {
        Some(map) => {
            for (field, path) in map {
                let value = resolve_path(&contribution, path)
                    .cloned()
                    .unwrap_or(Value::Null);
                acc.insert(field.clone(), value);
            }
            Value::Object(acc)
        }
        None => match contribution {
            Value::Object(obj) => {
                for (k, v) in obj {
                    acc.insert(k, v);
                }
                Value::Object(acc)
            }
            other if acc.is_empty() => other,
            other => {
                acc.insert("item".to_string(), other);
                Value::Object(acc)
            }
        },
    }
}

/// Walk a dot-path (`location.city`, `items.0.sku`) into a JSON value.
/// The empty path names the value itself.
pub(crate) fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_path_walks_objects_and_arrays() {
        let v = json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(resolve_path(&v, "a.b.0.c"), Some(&json!(7)));
        assert_eq!(resolve_path(&v, ""), Some(&v));
        assert_eq!(resolve_path(&v, "a.missing"), None);
        assert_eq!(resolve_path(&v, "a.b.9.c"), None);
    }

    #[test]
    fn shape_contribution_maps_fields_over_defaults() {
        let mut defaults = Map::new();
        defaults.insert("country".to_string(), json!("NZ"));
        let contribution = json!({"location": {"city": "Wellington"}});
        let mut map = std::collections::BTreeMap::new();
        map.insert("city".to_string(), "location.city".to_string());

        let out = shape_contribution(defaults, contribution, Some(&map));
        assert_eq!(out, json!({"country": "NZ", "city": "Wellington"}));
    }

    #[test]
    fn shape_contribution_scalar_passthrough() {
        let out = shape_contribution(Map::new(), json!(10), None);
        assert_eq!(out, json!(10));
    }

    #[test]
    fn shape_contribution_scalar_with_defaults_keyed_as_item() {
        let mut defaults = Map::new();
        defaults.insert("mode".to_string(), json!("fast"));
        let out = shape_contribution(defaults, json!(10), None);
        assert_eq!(out, json!({"mode": "fast", "item": 10}));
    }

    #[test]
    fn shape_contribution_object_merges_last_writer_wins() {
        let mut defaults = Map::new();
        defaults.insert("x".to_string(), json!(1));
        let out = shape_contribution(defaults, json!({"x": 2, "y": 3}), None);
        assert_eq!(out, json!({"x": 2, "y": 3}));
    }
}
