//! Foundational types for the Trellis execution model.
//!
//! Every persisted type here is `Serialize + Deserialize + Debug + Clone`.
//! Map fields that reach serialization use `BTreeMap` (never `HashMap`) so
//! JSON output is deterministic — a correctness invariant for stored run
//! state, not a style choice.

pub mod execution;
pub mod graph;

pub use execution::*;
pub use graph::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Current schema version for GraphDef serialization.
pub const GRAPH_SCHEMA_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Node status
// ---------------------------------------------------------------------------

/// Lifecycle status of a single node within a run.
///
/// The legal transitions between these values are defined in
/// [`crate::transition`]; every write path goes through that validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    WaitingForUser,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingForUser => "waiting_for_user",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Node kind
// ---------------------------------------------------------------------------

/// What a node does when fired. The discriminant every handler dispatch
/// switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Delegates to an in-process delegate or an external worker reached
    /// via the callback contract.
    Worker,
    /// Fans an array out into parallel per-element instances.
    Splitter,
    /// Fans parallel instances back in, merging outputs in split order.
    Collector,
    /// Pauses the branch until a human supplies input.
    UxGate,
}

// ---------------------------------------------------------------------------
// Node keys
// ---------------------------------------------------------------------------

/// Identifier for a node state within a run: either a static node id from
/// the graph, or an augmented id `{base}_{i}` naming the i-th parallel
/// instance seeded by a Splitter.
///
/// Static node ids may themselves end in `_<digits>` (e.g. `step_2`), so a
/// key alone cannot tell whether it is augmented — resolution against the
/// graph's static id set lives in
/// [`ExecutionGraph::base_id`](crate::compile::ExecutionGraph::base_id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the augmented key for the `index`-th parallel instance of `base`.
    pub fn augmented(base: &str, index: usize) -> Self {
        Self(format!("{base}_{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Syntactic split into `(prefix, numeric_suffix)`. Returns `None` when
    /// the key has no `_<digits>` tail. Purely lexical — callers must still
    /// check the prefix against the graph's static ids.
    pub fn split_suffix(&self) -> Option<(&str, usize)> {
        let (prefix, tail) = self.0.rsplit_once('_')?;
        if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        tail.parse().ok().map(|i| (prefix, i))
    }

    /// True when this key names a parallel instance of `base`.
    pub fn is_instance_of(&self, base: &str) -> bool {
        matches!(self.split_suffix(), Some((prefix, _)) if prefix == base)
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Compiled node spec
// ---------------------------------------------------------------------------

/// Everything the engine needs to fire a node, with presentation data
/// stripped at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeSpec {
    pub kind: NodeKind,
    /// Delegate name for [`NodeKind::Worker`] dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    /// Static configuration passed verbatim to the handler / delegate.
    pub config: serde_json::Value,
    /// Dot-path into the merged input naming the array to fan out.
    /// Present only for [`NodeKind::Splitter`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_path: Option<String>,
    /// Input fields that must be satisfied by an edge mapping or a default.
    #[serde(default)]
    pub required_inputs: BTreeSet<String>,
    /// Declared defaults for otherwise-unmapped inputs.
    #[serde(default)]
    pub defaults: std::collections::BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Serialize + for<'de> Deserialize<'de>>(val: &T) -> T {
        let json = serde_json::to_string(val).expect("serialize");
        serde_json::from_str(&json).expect("deserialize")
    }

    #[test]
    fn node_status_round_trip() {
        let statuses = [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::WaitingForUser,
        ];
        for s in &statuses {
            assert_eq!(s, &round_trip(s));
        }
    }

    #[test]
    fn node_status_snake_case_wire_format() {
        let json = serde_json::to_string(&NodeStatus::WaitingForUser).unwrap();
        assert_eq!(json, "\"waiting_for_user\"");
    }

    #[test]
    fn node_key_serializes_as_bare_string() {
        let key = NodeKey::augmented("enrich", 2);
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"enrich_2\"");
    }

    #[test]
    fn split_suffix_parses_numeric_tail() {
        assert_eq!(NodeKey::new("enrich_0").split_suffix(), Some(("enrich", 0)));
        assert_eq!(NodeKey::new("step_2_13").split_suffix(), Some(("step_2", 13)));
        assert_eq!(NodeKey::new("enrich").split_suffix(), None);
        assert_eq!(NodeKey::new("enrich_").split_suffix(), None);
        assert_eq!(NodeKey::new("enrich_x1").split_suffix(), None);
    }

    #[test]
    fn is_instance_of_checks_prefix() {
        let key = NodeKey::augmented("step_2", 4);
        assert!(key.is_instance_of("step_2"));
        assert!(!key.is_instance_of("step"));
        assert!(!NodeKey::new("step_2").is_instance_of("step_2"));
    }
}
