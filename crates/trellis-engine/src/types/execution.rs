//! Run state: per-node durable state, field-level patches, and the wire
//! payloads exchanged with external worker delegates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{NodeKey, NodeStatus};

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

/// Durable state for one [`NodeKey`] within a run.
///
/// The `expected_upstream` / `upstream_completed` counters exist only on
/// Collector nodes and are advisory — collector completion is always
/// re-derived from the authoritative per-key statuses, never from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeState {
    pub status: NodeStatus,
    /// Node output once completed. For a freshly seeded parallel instance
    /// this holds the split element the instance will consume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Merged input captured at fire time; retries re-dispatch from this
    /// without recomputing upstream data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fixed at the collector's first observation of its parallel upstream
    /// paths; immutable for the rest of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_upstream: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_completed: Option<u32>,
}

impl NodeState {
    /// Fresh state as seeded at run creation.
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            input: None,
            started_at: None,
            completed_at: None,
            expected_upstream: None,
            upstream_completed: None,
        }
    }

    /// Seed state for a parallel instance carrying its split element.
    pub fn seeded(element: serde_json::Value) -> Self {
        Self {
            output: Some(element),
            ..Self::pending()
        }
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// A targeted field-level update to a single node state.
///
/// Only the fields present are written; everything else is left untouched.
/// This is what lets concurrent patches to different keys (and different
/// fields) never lose each other's writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_upstream: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_completed: Option<u32>,
}

impl NodePatch {
    /// Transition to Running, stamping the start time.
    pub fn running() -> Self {
        Self {
            status: Some(NodeStatus::Running),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Terminal Completed transition with the node's output.
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status: Some(NodeStatus::Completed),
            output: Some(output),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Terminal Failed transition preserving the error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(NodeStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Apply this patch to a state. Transition legality is the store's
    /// responsibility; this only writes fields.
    pub fn apply(&self, state: &mut NodeState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(ref output) = self.output {
            state.output = Some(output.clone());
        }
        if let Some(ref error) = self.error {
            state.error = Some(error.clone());
        }
        if let Some(ref input) = self.input {
            state.input = Some(input.clone());
        }
        if let Some(started_at) = self.started_at {
            state.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            state.completed_at = Some(completed_at);
        }
        if let Some(expected) = self.expected_upstream {
            state.expected_upstream = Some(expected);
        }
        if let Some(done) = self.upstream_completed {
            state.upstream_completed = Some(done);
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Derived run-level status. Never stored — always computed from the
/// per-node states, which remain the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Work is pending or in flight.
    Active,
    /// At least one branch is parked on a UX gate and nothing has failed.
    WaitingForUser,
    Completed,
    Failed,
}

/// One execution instance of a compiled graph.
///
/// `node_states` is the only shared mutable resource in the engine; all
/// mutation goes through the store's atomic patch primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Run {
    pub run_id: String,
    pub graph_id: String,
    /// Graph version this run was compiled against. Pins the run to its
    /// own [`ExecutionGraph`](crate::ExecutionGraph) so re-registering the
    /// graph never rewires work already in flight.
    #[serde(default)]
    pub graph_version: String,
    /// Trigger payload handed to the run's entry nodes.
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ref: Option<String>,
    pub node_states: BTreeMap<NodeKey, NodeState>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// New run with every static node id seeded Pending.
    pub fn new<'a>(
        graph_id: &str,
        graph_version: &str,
        static_ids: impl Iterator<Item = &'a String>,
        inputs: serde_json::Value,
        entity_ref: Option<String>,
    ) -> Self {
        let node_states = static_ids
            .map(|id| (NodeKey::new(id.clone()), NodeState::pending()))
            .collect();
        Self {
            run_id: Uuid::new_v4().to_string(),
            graph_id: graph_id.to_string(),
            graph_version: graph_version.to_string(),
            inputs,
            entity_ref,
            node_states,
            created_at: Utc::now(),
        }
    }

    /// Compute the run-level status from the node states: any failure
    /// makes the run failed, any parked gate makes it waiting, everything
    /// completed makes it done, otherwise it is still active.
    pub fn status(&self) -> RunStatus {
        let mut all_completed = true;
        let mut waiting = false;
        for (key, state) in &self.node_states {
            // A fan-out consumer's own key stays Pending while its seeded
            // instances do the work; the instances carry the status.
            if state.status == NodeStatus::Pending
                && self
                    .node_states
                    .contains_key(&NodeKey::augmented(key.as_str(), 0))
            {
                continue;
            }
            match state.status {
                NodeStatus::Failed => return RunStatus::Failed,
                NodeStatus::WaitingForUser => waiting = true,
                NodeStatus::Completed => {}
                _ => all_completed = false,
            }
        }
        if waiting {
            RunStatus::WaitingForUser
        } else if all_completed {
            RunStatus::Completed
        } else {
            RunStatus::Active
        }
    }

    pub fn state(&self, key: &NodeKey) -> Option<&NodeState> {
        self.node_states.get(key)
    }

    pub fn status_of(&self, key: &NodeKey) -> Option<NodeStatus> {
        self.node_states.get(key).map(|s| s.status)
    }

    /// All parallel instances of `base` present in this run, sorted by
    /// numeric suffix so merged outputs preserve the original split order.
    pub fn instances_of(&self, base: &str) -> Vec<(NodeKey, &NodeState)> {
        let mut found: Vec<(usize, NodeKey, &NodeState)> = self
            .node_states
            .iter()
            .filter_map(|(key, state)| {
                let (prefix, index) = key.split_suffix()?;
                (prefix == base).then(|| (index, key.clone(), state))
            })
            .collect();
        found.sort_by_key(|(index, _, _)| *index);
        found.into_iter().map(|(_, key, state)| (key, state)).collect()
    }
}

// ---------------------------------------------------------------------------
// External worker contracts
// ---------------------------------------------------------------------------

/// Payload sent to an external worker delegate (engine → delegate).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerDispatch {
    pub run_id: String,
    pub node_id: String,
    pub config: serde_json::Value,
    pub input: serde_json::Value,
    pub callback_url: String,
}

/// Result reported back through the callback contract (delegate → engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CallbackOutcome {
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackOutcome {
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status: CallbackStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CallbackStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_seeds_static_nodes_pending() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let run = Run::new("g1", "1", ids.iter(), serde_json::json!({}), None);
        assert_eq!(run.node_states.len(), 3);
        for state in run.node_states.values() {
            assert_eq!(state.status, NodeStatus::Pending);
            assert!(state.output.is_none());
        }
        assert!(!run.run_id.is_empty());
    }

    #[test]
    fn patch_apply_writes_only_present_fields() {
        let mut state = NodeState::seeded(json!(10));
        NodePatch::running().apply(&mut state);
        assert_eq!(state.status, NodeStatus::Running);
        // Seeded element survives a status-only patch.
        assert_eq!(state.output, Some(json!(10)));
        assert!(state.started_at.is_some());

        NodePatch::completed(json!({"v": 20})).apply(&mut state);
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.output, Some(json!({"v": 20})));
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn instances_sorted_by_numeric_suffix() {
        let mut run = Run::new("g1", "1", std::iter::empty(), serde_json::json!({}), None);
        for i in [10usize, 2, 0, 1] {
            run.node_states.insert(
                NodeKey::augmented("work", i),
                NodeState::seeded(json!(i)),
            );
        }
        // Unrelated keys must not match.
        run.node_states
            .insert(NodeKey::new("workshop_1"), NodeState::pending());

        let instances = run.instances_of("work");
        let indices: Vec<usize> = instances
            .iter()
            .map(|(k, _)| k.split_suffix().unwrap().1)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 10]);
    }

    #[test]
    fn run_status_derivation() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut run = Run::new("g1", "1", ids.iter(), serde_json::json!({}), None);
        assert_eq!(run.status(), RunStatus::Active);

        let mut done = NodeState::pending();
        done.status = NodeStatus::Completed;
        run.node_states.insert(NodeKey::new("a"), done.clone());
        assert_eq!(run.status(), RunStatus::Active);

        let mut waiting = NodeState::pending();
        waiting.status = NodeStatus::WaitingForUser;
        run.node_states.insert(NodeKey::new("b"), waiting);
        assert_eq!(run.status(), RunStatus::WaitingForUser);

        run.node_states.insert(NodeKey::new("b"), done);
        assert_eq!(run.status(), RunStatus::Completed);

        let mut failed = NodeState::pending();
        failed.status = NodeStatus::Failed;
        run.node_states.insert(NodeKey::new("a"), failed);
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn run_status_skips_fanned_out_base_keys() {
        let ids = vec!["work".to_string()];
        let mut run = Run::new("g1", "1", ids.iter(), serde_json::json!({}), None);
        // Base key stays Pending while its seeded instance carries the work.
        let mut done = NodeState::seeded(json!(0));
        done.status = NodeStatus::Completed;
        run.node_states.insert(NodeKey::augmented("work", 0), done);
        assert_eq!(run.status(), RunStatus::Completed);
    }

    #[test]
    fn callback_outcome_wire_format() {
        let outcome = CallbackOutcome::completed(json!({"x": 1}));
        let json_str = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json_str, r#"{"status":"completed","output":{"x":1}}"#);

        let parsed: CallbackOutcome =
            serde_json::from_str(r#"{"status":"failed","error":"boom"}"#).unwrap();
        assert_eq!(parsed.status, CallbackStatus::Failed);
        assert_eq!(parsed.error.as_deref(), Some("boom"));
    }
}
