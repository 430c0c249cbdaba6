//! Engine assembly and public API — the single entry point for callers.
//!
//! The [`Engine`] owns the compiled graph registry, the run store, the
//! worker delegate registry, and the external dispatch / entity tracking
//! seams. Construct via [`Engine::builder()`].
//!
//! ```rust,ignore
//! let engine = Engine::builder()
//!     .run_store(InMemoryRunStore::new())
//!     .worker("enrich", EnrichDelegate)
//!     .dispatcher(HttpDispatcher::new("https://workers.internal"))
//!     .build();
//!
//! engine.register_graph(&graph)?;
//! let run = engine.start_run("my-graph", json!({}), None).await?;
//! ```
//!
//! Execution is reactive: the engine holds no scheduler and no internal
//! thread pool. Progress happens inside the caller's invocation — a run
//! start, a worker callback, a user resume — and each invocation walks
//! the graph as far as the newly completed work allows.

mod builder;
pub mod error;
pub(crate) mod walker;

pub use builder::EngineBuilder;
pub use error::EngineError;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::compile::{self, ExecutionGraph};
use crate::traits::{EntityTracker, RunOutcome, RunStore, WorkerDelegate, WorkerDispatcher};
use crate::types::{CallbackOutcome, CallbackStatus, GraphDef, NodeKey, NodeKind, NodePatch, NodeStatus, Run};

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL stamped into every external dispatch's callback_url.
    pub callback_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// The assembled engine runtime.
///
/// `Clone`-friendly — all internals are `Arc`-wrapped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Compiled graphs, pinned per version so in-flight runs are never
/// rewired by a re-registration.
#[derive(Default)]
pub(crate) struct GraphRegistry {
    /// Latest registration per graph id; new runs start here.
    current: HashMap<String, Arc<ExecutionGraph>>,
    /// Every registered compile, keyed by (graph id, version). Runs
    /// resolve through this map for their whole lifetime.
    pinned: HashMap<(String, String), Arc<ExecutionGraph>>,
}

pub(crate) struct EngineInner {
    pub(crate) graphs: RwLock<GraphRegistry>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) workers: HashMap<String, Arc<dyn WorkerDelegate>>,
    pub(crate) dispatcher: Arc<dyn WorkerDispatcher>,
    pub(crate) tracker: Arc<dyn EntityTracker>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Compile and register an editable graph, replacing any previous
    /// version under the same id. Runs already started keep executing
    /// against the graph they were compiled with.
    pub async fn register_graph(&self, def: &GraphDef) -> Result<(), EngineError> {
        let compiled = Arc::new(
            compile::compile(def).map_err(|errors| EngineError::InvalidGraph { errors })?,
        );
        let mut graphs = self.inner.graphs.write().await;
        graphs
            .pinned
            .insert((def.id.clone(), def.version.clone()), Arc::clone(&compiled));
        graphs.current.insert(def.id.clone(), compiled);
        Ok(())
    }

    /// Start a run of a registered graph and fire its entry nodes.
    ///
    /// Returns the run's durable state once execution has progressed as
    /// far as in-process work allows; nodes dispatched to external workers
    /// stay `Running` until their callbacks arrive.
    pub async fn start_run(
        &self,
        graph_id: &str,
        inputs: Value,
        entity_ref: Option<String>,
    ) -> Result<Run, EngineError> {
        let graph = self.inner.graph(graph_id).await?;
        let run = Run::new(
            graph_id,
            &graph.version,
            graph.nodes.keys(),
            inputs,
            entity_ref.clone(),
        );
        let run_id = run.run_id.clone();
        self.inner.store.create_run(run).await?;

        tracing::info!(run_id = %run_id, graph_id, "run started");
        if let Some(entity) = &entity_ref {
            self.inner.tracker.run_started(entity, &run_id).await;
        }

        for entry in graph.entry_nodes.clone() {
            self.inner
                .fire(&graph, &run_id, &NodeKey::new(entry))
                .await?;
        }
        self.inner.check_run_completion(&graph, &run_id).await?;
        Ok(self.inner.store.get_run(&run_id).await?)
    }

    /// Deliver an external worker's result for a `Running` node.
    ///
    /// A duplicate or stale callback is rejected with an error whose
    /// [`is_stale_callback`](EngineError::is_stale_callback) is true; the
    /// first delivery always wins.
    pub async fn complete_node(
        &self,
        run_id: &str,
        key: &NodeKey,
        outcome: CallbackOutcome,
    ) -> Result<Run, EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        let graph = self.inner.graph_for_run(&run).await?;
        if graph.base_id(key).is_none() {
            return Err(EngineError::UnknownNode {
                key: key.to_string(),
            });
        }

        match outcome.status {
            CallbackStatus::Completed => {
                let output = outcome.output.unwrap_or(Value::Null);
                self.inner
                    .store
                    .patch_node(run_id, key, NodePatch::completed(output))
                    .await?;
                tracing::debug!(run_id, key = %key, "node completed via callback");
                self.inner.walk_from(&graph, run_id, key).await?;
                self.inner.check_run_completion(&graph, run_id).await?;
            }
            CallbackStatus::Failed => {
                let message = outcome.error.unwrap_or_else(|| "worker failed".to_string());
                // Transition validated inside; a stale failure surfaces too.
                self.inner
                    .store
                    .patch_node(run_id, key, NodePatch::failed(&message))
                    .await?;
                tracing::warn!(run_id, key = %key, error = %message, "node failed via callback");
                self.inner.notify_finished(run_id, RunOutcome::Failed).await;
                self.inner
                    .fire_downstream_collectors(&graph, run_id, key)
                    .await?;
            }
        }
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// Mark a `Running` node failed from outside the callback contract
    /// (operator action, watchdog).
    pub async fn fail_node(
        &self,
        run_id: &str,
        key: &NodeKey,
        error: &str,
    ) -> Result<Run, EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        let graph = self.inner.graph_for_run(&run).await?;
        self.inner
            .store
            .patch_node(run_id, key, NodePatch::failed(error))
            .await?;
        tracing::warn!(run_id, key = %key, error, "node failed");
        self.inner.notify_finished(run_id, RunOutcome::Failed).await;
        self.inner
            .fire_downstream_collectors(&graph, run_id, key)
            .await?;
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// Supply the human decision a `WaitingForUser` gate is blocked on.
    /// The gate completes with `payload` merged over its captured input
    /// and the walk continues downstream.
    pub async fn resume_node(
        &self,
        run_id: &str,
        key: &NodeKey,
        payload: Value,
    ) -> Result<Run, EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        let graph = self.inner.graph_for_run(&run).await?;
        let state = run.state(key).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        if state.status != NodeStatus::WaitingForUser {
            return Err(EngineError::NotWaiting {
                key: key.to_string(),
            });
        }

        let output = merge_shallow(state.input.clone().unwrap_or(Value::Null), payload);
        self.inner
            .store
            .patch_node(run_id, key, NodePatch::running())
            .await?;
        self.inner
            .store
            .patch_node(run_id, key, NodePatch::completed(output))
            .await?;
        tracing::info!(run_id, key = %key, "gate resumed");

        self.inner.walk_from(&graph, run_id, key).await?;
        self.inner.check_run_completion(&graph, run_id).await?;
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// Re-run a `Failed` node from its stored input.
    pub async fn retry_node(&self, run_id: &str, key: &NodeKey) -> Result<Run, EngineError> {
        let run = self.inner.store.get_run(run_id).await?;
        let graph = self.inner.graph_for_run(&run).await?;
        let base = graph
            .base_id(key)
            .ok_or_else(|| EngineError::UnknownNode {
                key: key.to_string(),
            })?
            .to_string();
        let state = run.state(key).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        if state.status != NodeStatus::Failed {
            return Err(EngineError::NotRetryable {
                key: key.to_string(),
            });
        }

        self.inner
            .store
            .patch_node(run_id, key, NodePatch::running())
            .await?;
        tracing::info!(run_id, key = %key, "retrying node");

        let spec = graph.spec(&base).ok_or_else(|| EngineError::UnknownNode {
            key: key.to_string(),
        })?;
        let input = state.input.clone().unwrap_or(Value::Null);
        match spec.kind {
            NodeKind::Worker => {
                self.inner
                    .dispatch_worker(&graph, run_id, key, spec, input)
                    .await?;
            }
            NodeKind::Splitter => {
                self.inner
                    .split_and_seed(&graph, run_id, key, input)
                    .await?;
            }
            NodeKind::Collector => {
                self.inner.fire_collector(&graph, run_id, &base).await?;
            }
            NodeKind::UxGate => {
                self.inner.park_gate(run_id, key).await?;
            }
        }
        self.inner.check_run_completion(&graph, run_id).await?;
        Ok(self.inner.store.get_run(run_id).await?)
    }

    /// Fetch the full durable state of a run.
    pub async fn get_run(&self, run_id: &str) -> Result<Run, EngineError> {
        Ok(self.inner.store.get_run(run_id).await?)
    }
}

impl EngineInner {
    pub(crate) async fn graph(&self, graph_id: &str) -> Result<Arc<ExecutionGraph>, EngineError> {
        let graphs = self.graphs.read().await;
        graphs
            .current
            .get(graph_id)
            .cloned()
            .ok_or_else(|| EngineError::GraphNotFound {
                id: graph_id.to_string(),
            })
    }

    /// Resolve the exact graph version a run was started against.
    pub(crate) async fn graph_for_run(&self, run: &Run) -> Result<Arc<ExecutionGraph>, EngineError> {
        let graphs = self.graphs.read().await;
        graphs
            .pinned
            .get(&(run.graph_id.clone(), run.graph_version.clone()))
            .cloned()
            .ok_or_else(|| EngineError::GraphNotFound {
                id: run.graph_id.clone(),
            })
    }

    /// Tell the entity tracker the run reached a terminal outcome.
    /// Trackers must tolerate repeated notification — races can deliver it
    /// more than once.
    pub(crate) async fn notify_finished(&self, run_id: &str, outcome: RunOutcome) {
        match self.store.get_run(run_id).await {
            Ok(run) => {
                if let Some(entity) = &run.entity_ref {
                    self.tracker.run_finished(entity, run_id, outcome).await;
                }
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "run lookup failed during finish notification");
            }
        }
    }
}

/// Shallow merge `over` on top of `base`. Non-object operands degrade
/// gracefully: an object side wins key-by-key, otherwise `over` replaces
/// `base` entirely (unless `over` is null).
pub(crate) fn merge_shallow(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(mut b), Value::Object(o)) => {
            for (k, v) in o {
                b.insert(k, v);
            }
            Value::Object(b)
        }
        (b, Value::Null) => b,
        (_, o) => o,
    }
}
