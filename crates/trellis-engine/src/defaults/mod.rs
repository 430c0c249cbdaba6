//! Default in-memory implementations of the plugin traits.

mod in_memory_run_store;

pub use in_memory_run_store::InMemoryRunStore;
