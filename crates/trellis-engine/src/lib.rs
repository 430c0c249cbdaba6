//! Trellis — reactive, database-backed workflow execution.
//!
//! This crate provides the core types, traits, and runtime for executing
//! graph-based workflows against a durable run store. The engine holds no
//! scheduler and no internal thread pool: every external trigger (a run
//! start, a worker callback, a user resume) advances the graph as far as
//! the newly completed work allows, and concurrent triggers racing over
//! the same region are resolved by status transition validation at the
//! store's write point.
//!
//! The engine is designed to be embedded in other applications and has
//! zero dependencies on web servers, databases, or other application-level
//! concerns.

pub mod compile;
pub mod defaults;
pub mod engine;
pub mod errors;
pub(crate) mod handlers;
pub mod traits;
pub mod transition;
pub mod types;

// Re-export public types at the crate level.

// compile
pub use compile::{compile, ExecutionGraph, ValidationError};

// defaults
pub use defaults::InMemoryRunStore;

// engine
pub use engine::{Engine, EngineBuilder, EngineConfig, EngineError};

// errors
pub use errors::{DispatchError, RunStoreError, WorkerError};

// traits
pub use traits::{
    EntityTracker, NoopDispatcher, NoopEntityTracker, RunOutcome, RunStore, WorkerDelegate,
    WorkerDispatcher,
};

// transition
pub use transition::{is_valid_transition, IllegalTransition};

// types
pub use types::{
    CallbackOutcome, CallbackStatus, Edge, GraphDef, NodeInstance, NodeKey, NodeKind, NodePatch,
    NodeSpec, NodeState, NodeStatus, Run, RunStatus, WorkerDispatch, GRAPH_SCHEMA_VERSION,
};
