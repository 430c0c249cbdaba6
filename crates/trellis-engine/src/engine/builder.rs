//! Engine builder — assembles the runtime components.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Engine, EngineConfig, EngineInner, GraphRegistry};
use crate::defaults::InMemoryRunStore;
use crate::traits::{
    EntityTracker, NoopDispatcher, NoopEntityTracker, RunStore, WorkerDelegate, WorkerDispatcher,
};

/// Builder for assembling the [`Engine`].
///
/// All component fields are optional — in-memory / no-op defaults are
/// applied during [`build()`](EngineBuilder::build).
pub struct EngineBuilder {
    run_store: Option<Arc<dyn RunStore>>,
    workers: HashMap<String, Arc<dyn WorkerDelegate>>,
    dispatcher: Option<Arc<dyn WorkerDispatcher>>,
    tracker: Option<Arc<dyn EntityTracker>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            run_store: None,
            workers: HashMap::new(),
            dispatcher: None,
            tracker: None,
            config: EngineConfig::default(),
        }
    }

    /// Set the run store. Default: [`InMemoryRunStore`].
    pub fn run_store(mut self, store: impl RunStore + 'static) -> Self {
        self.run_store = Some(Arc::new(store));
        self
    }

    /// Register an in-process worker delegate under a `worker_type` name.
    /// Worker nodes whose type has no delegate go to the dispatcher.
    pub fn worker(mut self, worker_type: &str, delegate: impl WorkerDelegate + 'static) -> Self {
        self.workers
            .insert(worker_type.to_string(), Arc::new(delegate));
        self
    }

    /// Set the external dispatch seam. Default: [`NoopDispatcher`].
    pub fn dispatcher(mut self, dispatcher: impl WorkerDispatcher + 'static) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Set the entity tracker. Default: [`NoopEntityTracker`].
    pub fn entity_tracker(mut self, tracker: impl EntityTracker + 'static) -> Self {
        self.tracker = Some(Arc::new(tracker));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                graphs: RwLock::new(GraphRegistry::default()),
                store: self
                    .run_store
                    .unwrap_or_else(|| Arc::new(InMemoryRunStore::new())),
                workers: self.workers,
                dispatcher: self.dispatcher.unwrap_or_else(|| Arc::new(NoopDispatcher)),
                tracker: self.tracker.unwrap_or_else(|| Arc::new(NoopEntityTracker)),
                config: self.config,
            }),
        }
    }
}
