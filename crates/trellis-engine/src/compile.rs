//! Graph compiler: turns an editable [`GraphDef`] into an immutable
//! [`ExecutionGraph`].
//!
//! Compilation validates acyclicity (3-color DFS reporting the exact cycle
//! path) and required-input satisfaction, strips presentation-only data,
//! and precomputes the adjacency maps and entry/terminal sets the walker
//! depends on for O(1) lookups. Node identifiers are preserved exactly —
//! they are the join key for every runtime lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::types::{Edge, GraphDef, NodeKey, NodeKind, NodeSpec};

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Compile-time graph defects. Fatal: a graph with any of these never
/// produces an [`ExecutionGraph`], and the full list is always reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    EmptyGraph,
    #[error("duplicate node id: {node}")]
    DuplicateNode { node: String },
    #[error("duplicate edge id: {edge}")]
    DuplicateEdge { edge: String },
    #[error("edge {edge} references unknown node: {node}")]
    UnknownEdgeEndpoint { edge: String, node: String },
    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("node {node}: required input `{field}` has no edge mapping and no default")]
    MissingInput { node: String, field: String },
    #[error("worker node {node} has no worker_type")]
    MissingWorkerType { node: String },
    #[error("splitter node {node} has no array_path in its config")]
    MissingArrayPath { node: String },
    #[error("node {node} consumes splitter {splitter} and cannot also depend on {other}")]
    MixedParallelInput {
        node: String,
        splitter: String,
        other: String,
    },
    #[error("node id {node} collides with the parallel instance keys of {base}")]
    AmbiguousNodeId { node: String, base: String },
}

// ---------------------------------------------------------------------------
// Execution graph
// ---------------------------------------------------------------------------

/// Compiled, immutable DAG representation used at runtime.
///
/// Created once per graph version and read-only thereafter, so it is safe
/// to share across concurrent invocations without locking.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub graph_id: String,
    pub version: String,
    /// O(1) node lookup by static id.
    pub nodes: HashMap<String, NodeSpec>,
    /// Downstream neighbors, in edge declaration order.
    pub adjacency: HashMap<String, Vec<String>>,
    /// Upstream neighbors, in edge declaration order. Merge order for
    /// multi-upstream inputs follows this ordering (last writer wins).
    pub upstream: HashMap<String, Vec<String>>,
    /// Per-edge field remapping: (from, to) → target field → source path.
    /// Only edges with a non-empty map are present.
    pub edge_data: HashMap<(String, String), BTreeMap<String, String>>,
    pub entry_nodes: BTreeSet<String>,
    pub terminal_nodes: BTreeSet<String>,
}

impl ExecutionGraph {
    pub fn spec(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn downstream(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn upstream_of(&self, id: &str) -> &[String] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_map(&self, from: &str, to: &str) -> Option<&BTreeMap<String, String>> {
        self.edge_data.get(&(from.to_string(), to.to_string()))
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminal_nodes.contains(id)
    }

    /// Resolve a run-state key to its static node id.
    ///
    /// A key is augmented only when it is not itself a static id and
    /// stripping one `_<digits>` suffix yields one — static ids like
    /// `step_2` are never mis-parsed as instances of `step`.
    pub fn base_id<'a>(&'a self, key: &'a NodeKey) -> Option<&'a str> {
        if self.nodes.contains_key(key.as_str()) {
            return Some(key.as_str());
        }
        match key.split_suffix() {
            Some((prefix, _)) if self.nodes.contains_key(prefix) => {
                Some(&key.as_str()[..prefix.len()])
            }
            _ => None,
        }
    }

    /// Direct upstream Splitter of `id`, if any. The seeding source for
    /// parallel instances of `id`.
    pub fn seeding_splitter(&self, id: &str) -> Option<&str> {
        self.upstream_of(id)
            .iter()
            .find(|u| matches!(self.spec(u).map(|s| s.kind), Some(NodeKind::Splitter)))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile an editable graph. Returns the full list of validation errors
/// on failure; never partially compiles.
pub fn compile(graph: &GraphDef) -> Result<ExecutionGraph, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if graph.nodes.is_empty() {
        errors.push(ValidationError::EmptyGraph);
    }

    // Duplicate node ids.
    let mut seen_ids = BTreeSet::new();
    for node in &graph.nodes {
        if !seen_ids.insert(node.instance_id.as_str()) {
            errors.push(ValidationError::DuplicateNode {
                node: node.instance_id.clone(),
            });
        }
    }

    // Edge endpoints reference existing nodes; duplicate edge ids.
    let node_ids: BTreeSet<&str> = graph.nodes.iter().map(|n| n.instance_id.as_str()).collect();
    let mut seen_edge_ids = BTreeSet::new();
    for edge in &graph.edges {
        for endpoint in [&edge.from_node, &edge.to_node] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownEdgeEndpoint {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
        if !seen_edge_ids.insert(edge.id.as_str()) {
            errors.push(ValidationError::DuplicateEdge {
                edge: edge.id.clone(),
            });
        }
    }

    // Only walk the graph for cycles once the edge references are sound.
    if errors.is_empty() {
        if let Some(path) = find_cycle(graph) {
            errors.push(ValidationError::Cycle { path });
        }
    }

    // Per-kind config checks.
    for node in &graph.nodes {
        match node.kind {
            NodeKind::Worker if node.worker_type.is_none() => {
                errors.push(ValidationError::MissingWorkerType {
                    node: node.instance_id.clone(),
                });
            }
            NodeKind::Splitter => {
                let has_path = node
                    .config
                    .get("array_path")
                    .and_then(|v| v.as_str())
                    .is_some();
                if !has_path {
                    errors.push(ValidationError::MissingArrayPath {
                        node: node.instance_id.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    // Parallel-section shape. A splitter's consumer is fired per seeded
    // instance, so it cannot carry a second upstream (the instance input
    // is the split element alone), and no other node id may collide with
    // the `{base}_{i}` key space its instances occupy.
    let kind_of: HashMap<&str, NodeKind> = graph
        .nodes
        .iter()
        .map(|n| (n.instance_id.as_str(), n.kind))
        .collect();
    let mut upstream_ids: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        upstream_ids
            .entry(edge.to_node.as_str())
            .or_default()
            .push(edge.from_node.as_str());
    }
    let consumes_splitter = |id: &str| {
        upstream_ids
            .get(id)
            .into_iter()
            .flatten()
            .any(|u| kind_of.get(u) == Some(&NodeKind::Splitter))
    };
    for node in &graph.nodes {
        let id = node.instance_id.as_str();
        if node.kind != NodeKind::Collector {
            if let Some(ups) = upstream_ids.get(id) {
                if let Some(&splitter) = ups
                    .iter()
                    .find(|u| kind_of.get(**u) == Some(&NodeKind::Splitter))
                {
                    for &other in ups.iter().filter(|&&u| u != splitter) {
                        errors.push(ValidationError::MixedParallelInput {
                            node: id.to_string(),
                            splitter: splitter.to_string(),
                            other: other.to_string(),
                        });
                    }
                }
            }
        }
        let key = NodeKey::new(id);
        if let Some((prefix, _)) = key.split_suffix() {
            if node_ids.contains(prefix)
                && kind_of.get(prefix) != Some(&NodeKind::Collector)
                && consumes_splitter(prefix)
            {
                errors.push(ValidationError::AmbiguousNodeId {
                    node: id.to_string(),
                    base: prefix.to_string(),
                });
            }
        }
    }

    // Required-input satisfaction: every required field needs an explicit
    // edge mapping or a declared default.
    let mut incoming_mapped: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for edge in &graph.edges {
        let fields = incoming_mapped.entry(edge.to_node.as_str()).or_default();
        for field in edge.data_map.keys() {
            fields.insert(field.as_str());
        }
    }
    for node in &graph.nodes {
        let mapped = incoming_mapped.get(node.instance_id.as_str());
        for field in &node.required_inputs {
            let satisfied = node.defaults.contains_key(field)
                || mapped.is_some_and(|m| m.contains(field.as_str()));
            if !satisfied {
                errors.push(ValidationError::MissingInput {
                    node: node.instance_id.clone(),
                    field: field.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Build the compiled form, stripping presentation data.
    let mut nodes = HashMap::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let array_path = node
            .config
            .get("array_path")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        nodes.insert(
            node.instance_id.clone(),
            NodeSpec {
                kind: node.kind,
                worker_type: node.worker_type.clone(),
                config: node.config.clone(),
                array_path,
                required_inputs: node.required_inputs.clone(),
                defaults: node.defaults.clone(),
            },
        );
    }

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
    let mut edge_data = HashMap::new();
    for edge in &graph.edges {
        adjacency
            .entry(edge.from_node.clone())
            .or_default()
            .push(edge.to_node.clone());
        upstream
            .entry(edge.to_node.clone())
            .or_default()
            .push(edge.from_node.clone());
        if !edge.data_map.is_empty() {
            edge_data.insert(
                (edge.from_node.clone(), edge.to_node.clone()),
                edge.data_map.clone(),
            );
        }
    }

    let entry_nodes: BTreeSet<String> = graph
        .nodes
        .iter()
        .map(|n| n.instance_id.clone())
        .filter(|id| !upstream.contains_key(id))
        .collect();
    let terminal_nodes: BTreeSet<String> = graph
        .nodes
        .iter()
        .map(|n| n.instance_id.clone())
        .filter(|id| !adjacency.contains_key(id))
        .collect();

    Ok(ExecutionGraph {
        graph_id: graph.id.clone(),
        version: graph.version.clone(),
        nodes,
        adjacency,
        upstream,
        edge_data,
        entry_nodes,
        terminal_nodes,
    })
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// 3-color DFS. Returns the exact cycle path (closing back on its first
/// node) when one exists.
fn find_cycle(graph: &GraphDef) -> Option<Vec<String>> {
    let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
    for edge in &graph.edges {
        outgoing
            .entry(edge.from_node.as_str())
            .or_default()
            .push(edge);
    }

    let mut colors: HashMap<&str, Color> = graph
        .nodes
        .iter()
        .map(|n| (n.instance_id.as_str(), Color::White))
        .collect();
    let mut path: Vec<&str> = Vec::new();

    for node in &graph.nodes {
        if colors[node.instance_id.as_str()] == Color::White {
            if let Some(cycle) = dfs(&node.instance_id, &outgoing, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs<'a>(
    node: &'a str,
    outgoing: &HashMap<&str, Vec<&'a Edge>>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(node, Color::Gray);
    path.push(node);

    if let Some(edges) = outgoing.get(node) {
        for edge in edges {
            let target = edge.to_node.as_str();
            match colors.get(target).copied() {
                Some(Color::Gray) => {
                    // Gray revisit: the path from the target onward is the cycle.
                    let start = path.iter().position(|n| *n == target).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(target.to_string());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = dfs(target, outgoing, colors, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeInstance;
    use serde_json::json;

    fn worker(id: &str) -> NodeInstance {
        NodeInstance {
            instance_id: id.to_string(),
            kind: NodeKind::Worker,
            worker_type: Some("echo".into()),
            config: json!({}),
            required_inputs: BTreeSet::new(),
            defaults: BTreeMap::new(),
            position: Some((0.0, 0.0)),
            label: None,
        }
    }

    fn splitter(id: &str) -> NodeInstance {
        NodeInstance {
            instance_id: id.to_string(),
            kind: NodeKind::Splitter,
            worker_type: None,
            config: json!({"array_path": "items"}),
            required_inputs: BTreeSet::new(),
            defaults: BTreeMap::new(),
            position: None,
            label: None,
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: id.to_string(),
            from_node: from.to_string(),
            to_node: to.to_string(),
            data_map: BTreeMap::new(),
            label: None,
        }
    }

    fn graph(nodes: Vec<NodeInstance>, edges: Vec<Edge>) -> GraphDef {
        GraphDef {
            schema_version: 1,
            id: "g1".into(),
            name: "Test".into(),
            version: "1".into(),
            nodes,
            edges,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn linear_graph_compiles_with_entry_and_terminal_sets() {
        let g = graph(
            vec![worker("a"), worker("b"), worker("c")],
            vec![edge("e1", "a", "b"), edge("e2", "b", "c")],
        );
        let compiled = compile(&g).expect("compiles");
        assert_eq!(compiled.entry_nodes.iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(
            compiled.terminal_nodes.iter().collect::<Vec<_>>(),
            vec!["c"]
        );
        assert_eq!(compiled.downstream("a"), &["b".to_string()]);
        assert_eq!(compiled.upstream_of("c"), &["b".to_string()]);
    }

    #[test]
    fn cycle_reports_exact_path() {
        let g = graph(
            vec![worker("a"), worker("b"), worker("c")],
            vec![
                edge("e1", "a", "b"),
                edge("e2", "b", "c"),
                edge("e3", "c", "b"),
            ],
        );
        let errs = compile(&g).unwrap_err();
        let cycle = errs
            .iter()
            .find_map(|e| match e {
                ValidationError::Cycle { path } => Some(path.clone()),
                _ => None,
            })
            .expect("cycle error");
        assert_eq!(cycle, vec!["b", "c", "b"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(vec![worker("a")], vec![edge("e1", "a", "a")]);
        let errs = compile(&g).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::Cycle { path } if path == &["a", "a"])));
    }

    #[test]
    fn missing_required_input_reported_per_field() {
        let mut b = worker("b");
        b.required_inputs = ["city".to_string(), "country".to_string()].into();
        b.defaults.insert("country".into(), json!("NZ"));

        let mut e = edge("e1", "a", "b");
        e.data_map.insert("city".into(), "location.city".into());

        let ok = compile(&graph(vec![worker("a"), b.clone()], vec![e]));
        assert!(ok.is_ok(), "mapped + defaulted inputs satisfy the check");

        // Drop the mapping: `city` is now unsatisfied.
        let errs = compile(&graph(vec![worker("a"), b], vec![edge("e1", "a", "b")])).unwrap_err();
        assert_eq!(
            errs,
            vec![ValidationError::MissingInput {
                node: "b".into(),
                field: "city".into()
            }]
        );
    }

    #[test]
    fn all_errors_reported_never_partial() {
        let mut w = worker("w");
        w.worker_type = None;
        let g = graph(
            vec![w, worker("a"), worker("a")],
            vec![edge("e1", "a", "ghost")],
        );
        let errs = compile(&g).unwrap_err();
        assert!(errs.len() >= 3, "expected multiple errors, got {errs:?}");
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateNode { node } if node == "a")));
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownEdgeEndpoint { node, .. } if node == "ghost")));
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::MissingWorkerType { node } if node == "w")));
    }

    #[test]
    fn splitter_requires_array_path() {
        let splitter = NodeInstance {
            instance_id: "split".into(),
            kind: NodeKind::Splitter,
            worker_type: None,
            config: json!({}),
            required_inputs: BTreeSet::new(),
            defaults: BTreeMap::new(),
            position: None,
            label: None,
        };
        let errs = compile(&graph(vec![splitter], vec![])).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::MissingArrayPath { node } if node == "split")));
    }

    #[test]
    fn single_upstream_collector_is_legal() {
        let collector = NodeInstance {
            instance_id: "gather".into(),
            kind: NodeKind::Collector,
            worker_type: None,
            config: json!({}),
            required_inputs: BTreeSet::new(),
            defaults: BTreeMap::new(),
            position: None,
            label: None,
        };
        let g = graph(
            vec![worker("a"), collector],
            vec![edge("e1", "a", "gather")],
        );
        assert!(compile(&g).is_ok(), "pass-through collector compiles");
    }

    #[test]
    fn splitter_consumer_cannot_carry_a_second_upstream() {
        let g = graph(
            vec![splitter("seed"), worker("x"), worker("work")],
            vec![edge("e1", "seed", "work"), edge("e2", "x", "work")],
        );
        let errs = compile(&g).unwrap_err();
        assert_eq!(
            errs,
            vec![ValidationError::MixedParallelInput {
                node: "work".into(),
                splitter: "seed".into(),
                other: "x".into(),
            }]
        );

        // A collector downstream of the consumer may still mix upstreams.
        let collector = NodeInstance {
            instance_id: "gather".into(),
            kind: NodeKind::Collector,
            worker_type: None,
            config: json!({}),
            required_inputs: BTreeSet::new(),
            defaults: BTreeMap::new(),
            position: None,
            label: None,
        };
        let g = graph(
            vec![splitter("seed"), worker("work"), worker("x"), collector],
            vec![
                edge("e1", "seed", "work"),
                edge("e2", "work", "gather"),
                edge("e3", "x", "gather"),
            ],
        );
        assert!(compile(&g).is_ok());
    }

    #[test]
    fn static_id_colliding_with_instance_keys_is_rejected() {
        let g = graph(
            vec![splitter("seed"), worker("work"), worker("work_1")],
            vec![edge("e1", "seed", "work")],
        );
        let errs = compile(&g).unwrap_err();
        assert!(errs.iter().any(|e| matches!(
            e,
            ValidationError::AmbiguousNodeId { node, base } if node == "work_1" && base == "work"
        )));

        // Without a splitter feeding `work` there is no instance key space
        // to collide with.
        let g = graph(
            vec![worker("work"), worker("work_1")],
            vec![edge("e1", "work", "work_1")],
        );
        assert!(compile(&g).is_ok());
    }

    #[test]
    fn base_id_never_misparses_static_ids() {
        let g = graph(
            vec![worker("step"), worker("step_2")],
            vec![edge("e1", "step", "step_2")],
        );
        let compiled = compile(&g).expect("compiles");

        // A static id with a numeric tail resolves to itself.
        assert_eq!(compiled.base_id(&NodeKey::new("step_2")), Some("step_2"));
        // An instance of that id still resolves to it.
        assert_eq!(
            compiled.base_id(&NodeKey::new("step_2_0")),
            Some("step_2")
        );
        assert_eq!(compiled.base_id(&NodeKey::new("step_9")), Some("step"));
        assert_eq!(compiled.base_id(&NodeKey::new("other_1")), None);
    }
}
