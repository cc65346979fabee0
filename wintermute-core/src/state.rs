//! Run state: the open key→value map that accumulates across graph nodes.
//!
//! Keys beginning with `_` are reserved for router signals and budget
//! bookkeeping; agents own everything else. One run owns one state, so no
//! locking happens here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys every initial state must carry before a graph run starts.
pub const REQUIRED_KEYS: [&str; 4] = ["scope_type", "scope_id", "run_id", "graph_id"];

/// Reserved signal keys written by the orchestrator/router, read by agents.
pub mod keys {
    pub const CURRENT_AGENT_ID: &str = "_current_agent_id";
    pub const CURRENT_NODE_ID: &str = "_current_node_id";
    pub const LAST_CONFIDENCE: &str = "_last_confidence";
    pub const MISSING_CITATIONS_COUNT: &str = "_missing_citations_count";
    pub const CONTRADICTION_AMBIGUITY: &str = "_contradiction_ambiguity";
    pub const SYNTHESIS_COMPLEXITY: &str = "_synthesis_complexity";
    pub const BUDGET_USED_TOKENS: &str = "_budget_used_tokens";
    pub const BUDGET_USED_COST: &str = "_budget_used_cost";
    pub const DEGRADATION_ACTIVE: &str = "_degradation_active";
    pub const DEGRADATION: &str = "_degradation";
    pub const ESCALATED_NODES: &str = "_escalated_nodes";
}

/// A delta emitted by an agent, merged into run state by the orchestrator.
pub type DeltaState = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState {
    values: Map<String, Value>,
}

impl RunState {
    /// Build the initial state for a graph run.
    pub fn new(scope_type: &str, scope_id: &str, run_id: &str, graph_id: &str) -> Self {
        let mut values = Map::new();
        values.insert("scope_type".into(), Value::String(scope_type.into()));
        values.insert("scope_id".into(), Value::String(scope_id.into()));
        values.insert("run_id".into(), Value::String(run_id.into()));
        values.insert("graph_id".into(), Value::String(graph_id.into()));
        values.insert("artifacts".into(), Value::Array(vec![]));
        Self { values }
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Shallow merge: every delta key overwrites or inserts.
    pub fn merge_delta(&mut self, delta: DeltaState) {
        for (k, v) in delta {
            self.values.insert(k, v);
        }
    }

    /// Missing required base keys, empty when the state is runnable.
    pub fn missing_required(&self) -> Vec<String> {
        REQUIRED_KEYS
            .iter()
            .filter(|k| !self.values.contains_key(**k))
            .map(|k| k.to_string())
            .collect()
    }

    pub fn run_id(&self) -> &str {
        self.str_value("run_id").unwrap_or("")
    }

    pub fn scope_type(&self) -> &str {
        self.str_value("scope_type").unwrap_or("")
    }

    pub fn scope_id(&self) -> &str {
        self.str_value("scope_id").unwrap_or("")
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Numeric signal accessor, used for the router's escalation inputs.
    pub fn f64_value(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn u64_value(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    pub fn set_current_agent(&mut self, agent_id: &str) {
        self.insert(keys::CURRENT_AGENT_ID, Value::String(agent_id.into()));
    }

    pub fn set_current_node(&mut self, node_id: &str) {
        self.insert(keys::CURRENT_NODE_ID, Value::String(node_id.into()));
    }

    /// The node currently executing, falling back to `default` outside a
    /// graph walk (e.g. dispatcher-driven classification).
    pub fn current_node_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.str_value(keys::CURRENT_NODE_ID).unwrap_or(default)
    }

    /// Mark a node as escalated via an `on_fail` jump, so the router may serve
    /// the recovery pass with a frontier model when the policy allows.
    pub fn mark_escalated(&mut self, node: &str) {
        let list = self
            .values
            .entry(keys::ESCALATED_NODES.to_string())
            .or_insert_with(|| Value::Array(vec![]));
        if let Value::Array(items) = list {
            if !items.iter().any(|v| v.as_str() == Some(node)) {
                items.push(Value::String(node.into()));
            }
        }
    }

    pub fn is_escalated(&self, node: &str) -> bool {
        self.values
            .get(keys::ESCALATED_NODES)
            .and_then(Value::as_array)
            .map(|items| items.iter().any(|v| v.as_str() == Some(node)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_state_has_required_keys() {
        let state = RunState::new("certification", "az-104", "run-1", "cert");
        assert!(state.missing_required().is_empty());
        assert_eq!(state.scope_type(), "certification");
        assert_eq!(state.run_id(), "run-1");
    }

    #[test]
    fn merge_delta_is_monotonic_over_output_keys() {
        let mut state = RunState::new("topic", "rust", "run-2", "dossier");
        let before_keys: Vec<String> = state.as_map().keys().cloned().collect();

        let mut delta = DeltaState::new();
        delta.insert("claims".into(), json!([{"text": "x", "citations": ["d1"]}]));
        delta.insert("claim_count".into(), json!(1));
        state.merge_delta(delta);

        for key in before_keys {
            assert!(state.contains(&key));
        }
        assert!(state.contains("claims"));
        assert_eq!(state.u64_value("claim_count"), Some(1));
    }

    #[test]
    fn escalated_nodes_dedupe() {
        let mut state = RunState::new("topic", "rust", "run-3", "dossier");
        state.mark_escalated("extract_claims");
        state.mark_escalated("extract_claims");
        assert!(state.is_escalated("extract_claims"));
        assert!(!state.is_escalated("synthesize"));

        let list = state.get(keys::ESCALATED_NODES).unwrap().as_array().unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn signal_accessors() {
        let mut state = RunState::new("topic", "rust", "run-4", "dossier");
        state.insert(keys::LAST_CONFIDENCE, json!(0.42));
        state.insert(keys::MISSING_CITATIONS_COUNT, json!(3));
        assert_eq!(state.f64_value(keys::LAST_CONFIDENCE), Some(0.42));
        assert_eq!(state.u64_value(keys::MISSING_CITATIONS_COUNT), Some(3));
        assert_eq!(state.f64_value(keys::SYNTHESIS_COMPLEXITY), None);

        assert_eq!(state.current_node_or("dispatch"), "dispatch");
        state.set_current_node("extract_claims");
        assert_eq!(state.current_node_or("dispatch"), "extract_claims");
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = RunState::new("lab", "suite-1", "run-5", "lab");
        state.insert("tasks", json!(["t1", "t2"]));
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: RunState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.as_map(), state.as_map());
    }
}
