//! Editable graph schema — the contract between the canvas UI and the engine.
//!
//! These types carry presentation data (positions, labels) that the compiler
//! strips before execution. Node identifiers are load-bearing: they are the
//! join key for every runtime lookup and for external status displays, so
//! the compiler preserves them exactly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{NodeKind, GRAPH_SCHEMA_VERSION};

/// The complete editable definition of a workflow graph.
///
/// **Invariant**: `metadata` and per-node `defaults` use `BTreeMap`, never
/// `HashMap` — HashMap produces nondeterministic JSON key ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GraphDef {
    /// Schema version for forward-compatible deserialization.
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    pub id: String,
    pub name: String,
    pub version: String,
    pub nodes: Vec<NodeInstance>,
    pub edges: Vec<Edge>,
    /// Arbitrary editor metadata. Dropped at compile time.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_schema_version() -> u16 {
    GRAPH_SCHEMA_VERSION
}

/// A concrete node placed on the canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeInstance {
    pub instance_id: String,
    pub kind: NodeKind,
    /// Delegate name, required when `kind` is [`NodeKind::Worker`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Input fields this node cannot run without.
    #[serde(default)]
    pub required_inputs: BTreeSet<String>,
    /// Defaults satisfying required inputs that no edge maps.
    #[serde(default)]
    pub defaults: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Edge {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    /// Field remapping applied as data crosses this edge: target input
    /// field → dot-path into the upstream output. Empty means the upstream
    /// output is shallow-merged as-is.
    #[serde(default)]
    pub data_map: BTreeMap<String, String>,
    /// Human-readable label for the UI. Dropped at compile time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}
