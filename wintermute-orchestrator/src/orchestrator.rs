//! Graph runner: state-carrying sequential execution of a node chain with
//! retries, `on_fail` routing, budget enforcement, routing-decision
//! persistence, and checkpoint/resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};

use wintermute_agent::client::ModelClient;
use wintermute_agent::runtime::Agent;
use wintermute_core::budget::BudgetLedger;
use wintermute_core::error::{GraphError, InfraError, MissingStateError, WintermuteError};
use wintermute_core::graph::{Graph, GraphNode};
use wintermute_core::state::{keys, RunState};

use crate::checkpoint::CheckpointStore;
use crate::router::ModelRouter;
use crate::store::{DecisionStore, RoutingDecisionRecord, RunRecord};
use crate::telemetry::MetricsCollector;

/// A node that keeps failing into its `on_fail` edge is cut off after this
/// many cycles so emergent loops terminate.
const MAX_ON_FAIL_CYCLES: u32 = 3;

/// Lookup table from agent id to implementation.
#[derive(Default)]
pub struct AgentCatalog {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.id().to_string(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Failed,
    BudgetDegraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    pub event_id: String,
    pub run_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub status: NodeStatus,
    pub attempt: u32,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub tried_providers: Option<Vec<String>>,
    pub cost: Value,
    pub routing: Option<Value>,
    pub started_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Degraded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Degraded => "degraded",
        }
    }
}

/// Outcome of a graph run.
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub state: RunState,
    pub events: Vec<NodeEvent>,
    pub needs_human_review: bool,
    pub review_reasons: Vec<String>,
}

pub struct GraphRunner {
    catalog: AgentCatalog,
    default_client: Arc<dyn ModelClient>,
    frontier_client: Option<Arc<dyn ModelClient>>,
    router: Option<Arc<ModelRouter>>,
    store: Option<Arc<dyn DecisionStore>>,
    metrics: Arc<MetricsCollector>,
    checkpoints: Option<CheckpointStore>,
}

impl GraphRunner {
    pub fn new(catalog: AgentCatalog, default_client: Arc<dyn ModelClient>) -> Self {
        Self {
            catalog,
            default_client,
            frontier_client: None,
            router: None,
            store: None,
            metrics: Arc::new(MetricsCollector::new()),
            checkpoints: None,
        }
    }

    /// Frontier callable used when an `on_fail` jump escalated a node and the
    /// agent's policy permits frontier models. Ignored when a router is set.
    pub fn with_frontier_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.frontier_client = Some(client);
        self
    }

    pub fn with_router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DecisionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Run a graph from its entry node.
    pub async fn run(
        &self,
        graph: &Graph,
        state: RunState,
        budget: BudgetLedger,
    ) -> Result<RunResult, WintermuteError> {
        graph.validate()?;
        let missing = state.missing_required();
        if !missing.is_empty() {
            return Err(GraphError::InvalidInitialState(missing).into());
        }
        self.walk(graph, state, budget, graph.entry.clone(), 0).await
    }

    /// Resume a checkpointed run at the node after the last completed one.
    pub async fn resume(
        &self,
        graph: &Graph,
        run_id: &str,
        budget: BudgetLedger,
    ) -> Result<RunResult, WintermuteError> {
        graph.validate()?;
        let checkpoints = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| InfraError::Config("resume requires a checkpoint store".into()))?;
        let checkpoint = checkpoints
            .latest(run_id)?
            .ok_or_else(|| GraphError::UnknownResumeNode(run_id.to_string()))?;

        let node = graph
            .nodes
            .get(&checkpoint.node)
            .ok_or_else(|| GraphError::UnknownResumeNode(checkpoint.node.clone()))?;

        if node.end {
            tracing::info!(run_id, "checkpointed run already reached its terminal node");
            let (needs_review, reasons) = (budget.needs_human_review, budget.review_reasons().to_vec());
            return Ok(RunResult {
                run_id: run_id.to_string(),
                status: RunStatus::Completed,
                state: checkpoint.state,
                events: Vec::new(),
                needs_human_review: needs_review,
                review_reasons: reasons,
            });
        }
        let next = node.next.clone().ok_or_else(|| {
            GraphError::UnknownResumeNode(format!("{} has no next node", checkpoint.node))
        })?;

        tracing::info!(run_id, resume_at = %next, "resuming from checkpoint");
        self.walk(graph, checkpoint.state, budget, next, checkpoint.seq)
            .await
    }

    async fn walk(
        &self,
        graph: &Graph,
        mut state: RunState,
        mut budget: BudgetLedger,
        start_node: String,
        start_seq: u32,
    ) -> Result<RunResult, WintermuteError> {
        let run_id = state.run_id().to_string();
        let run_started = Instant::now();
        self.record_run_start(&state, graph).await;

        let mut events: Vec<NodeEvent> = Vec::new();
        let mut on_fail_counts: HashMap<String, u32> = HashMap::new();
        let mut seq = start_seq;
        let mut degraded = false;
        let mut current = Some(start_node);
        let mut step = 0u32;

        while let Some(name) = current.take() {
            step += 1;
            let node = graph.node(&name)?;
            tracing::info!(
                run_id = %run_id,
                step,
                node_id = %node.name,
                agent_id = %node.agent,
                "node starting"
            );

            if let Some(hint) = budget.degradation_hint() {
                state.insert(keys::DEGRADATION_ACTIVE, json!(true));
                state.insert(keys::DEGRADATION, json!(hint));
            }

            let event = self.execute_node(node, &mut state, &mut budget, &run_id).await;
            self.metrics.emit_event(
                serde_json::to_value(&event).unwrap_or_else(|_| json!({"node_id": node.name})),
            );
            if let Some(store) = &self.store {
                if let Ok(value) = serde_json::to_value(&event) {
                    if let Err(e) = store.insert_event(&run_id, &value).await {
                        tracing::debug!(error = %e, "failed to persist run event");
                    }
                }
            }

            let status = event.status;
            events.push(event);

            match status {
                NodeStatus::Success => {
                    seq += 1;
                    self.save_checkpoint(&run_id, seq, &node.name, &state);
                    if node.end {
                        tracing::info!(run_id = %run_id, node_id = %node.name, "terminal node completed");
                        current = None;
                    } else {
                        current = node.next.clone();
                    }
                }
                NodeStatus::BudgetDegraded => {
                    degraded = true;
                    seq += 1;
                    self.save_checkpoint(&run_id, seq, &node.name, &state);
                    current = if node.end { None } else { node.next.clone() };
                }
                NodeStatus::Failed => {
                    if let Some(on_fail) = &node.on_fail {
                        let count = on_fail_counts.entry(node.name.clone()).or_insert(0);
                        *count += 1;
                        if *count > MAX_ON_FAIL_CYCLES {
                            tracing::error!(
                                run_id = %run_id,
                                node_id = %node.name,
                                cycles = *count,
                                "max on_fail cycles exceeded, aborting run"
                            );
                            return Ok(self
                                .finish(run_id, RunStatus::Failed, state, events, budget, graph, run_started)
                                .await);
                        }
                        tracing::warn!(
                            run_id = %run_id,
                            node_id = %node.name,
                            on_fail = %on_fail,
                            cycle = *count,
                            "routing to on_fail node"
                        );
                        state.mark_escalated(on_fail);
                        current = Some(on_fail.clone());
                    } else {
                        tracing::error!(
                            run_id = %run_id,
                            node_id = %node.name,
                            "node failed with no on_fail, aborting run"
                        );
                        return Ok(self
                            .finish(run_id, RunStatus::Failed, state, events, budget, graph, run_started)
                            .await);
                    }
                }
            }
        }

        let status = if degraded {
            RunStatus::Degraded
        } else {
            RunStatus::Completed
        };
        Ok(self
            .finish(run_id, status, state, events, budget, graph, run_started)
            .await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run_id: String,
        status: RunStatus,
        state: RunState,
        events: Vec<NodeEvent>,
        budget: BudgetLedger,
        graph: &Graph,
        run_started: Instant,
    ) -> RunResult {
        self.metrics.record_run_duration(run_started.elapsed().as_secs_f64());
        self.metrics.record_token_usage(budget.total_tokens());
        self.record_run_final(&state, graph, status).await;
        RunResult {
            run_id,
            status,
            state,
            events,
            needs_human_review: budget.needs_human_review,
            review_reasons: budget.review_reasons().to_vec(),
        }
    }

    async fn record_run_start(&self, state: &RunState, graph: &Graph) {
        let Some(store) = &self.store else { return };
        let record = RunRecord {
            run_id: state.run_id().to_string(),
            graph_id: graph.id.clone(),
            scope_type: state.scope_type().to_string(),
            scope_id: state.scope_id().to_string(),
            status: "running".into(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        };
        if let Err(e) = store.upsert_run(&record).await {
            tracing::debug!(error = %e, "failed to persist run start");
        }
    }

    async fn record_run_final(&self, state: &RunState, graph: &Graph, status: RunStatus) {
        let Some(store) = &self.store else { return };
        let record = RunRecord {
            run_id: state.run_id().to_string(),
            graph_id: graph.id.clone(),
            scope_type: state.scope_type().to_string(),
            scope_id: state.scope_id().to_string(),
            status: status.as_str().to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        if let Err(e) = store.upsert_run(&record).await {
            tracing::debug!(error = %e, "failed to persist run result");
        }
    }

    fn save_checkpoint(&self, run_id: &str, seq: u32, node: &str, state: &RunState) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        if let Err(e) = checkpoints.save(run_id, seq, node, state) {
            // Checkpoints are durability, not correctness; a failed write
            // must not fail the run.
            tracing::warn!(run_id, node, error = %e, "checkpoint save failed");
        }
    }

    /// Pick the callable for one node: router decision when a router is
    /// attached, otherwise the frontier client for escalated nodes whose
    /// policy allows it, otherwise the default client.
    fn select_client(
        &self,
        node: &GraphNode,
        agent: &Arc<dyn Agent>,
        state: &RunState,
    ) -> (Arc<dyn ModelClient>, Option<crate::router::RoutingDecision>) {
        if let Some(router) = &self.router {
            let decision = router.select_model(agent.policy(), state);
            let client = router
                .callable_for(&decision)
                .unwrap_or_else(|| self.default_client.clone());
            return (client, Some(decision));
        }

        let escalate = self.frontier_client.is_some()
            && state.is_escalated(&node.name)
            && agent.policy().allows_frontier();
        if escalate {
            tracing::info!(node_id = %node.name, "escalating node to frontier model");
            (
                self.frontier_client.as_ref().expect("frontier checked").clone(),
                None,
            )
        } else {
            (self.default_client.clone(), None)
        }
    }

    async fn execute_node(
        &self,
        node: &GraphNode,
        state: &mut RunState,
        budget: &mut BudgetLedger,
        run_id: &str,
    ) -> NodeEvent {
        let started_at = chrono::Utc::now().to_rfc3339();
        let event_id = uuid::Uuid::new_v4().to_string();

        let Some(agent) = self.catalog.get(&node.agent) else {
            let mut event = node_event(&event_id, run_id, node, NodeStatus::Failed, 1, 0.0, budget, &started_at);
            event.error = Some(format!("unknown agent '{}'", node.agent));
            return event;
        };

        state.set_current_agent(agent.id());
        state.set_current_node(&node.name);
        let (client, decision) = self.select_client(node, &agent, state);
        if let Some(decision) = &decision {
            tracing::info!(
                node_id = %node.name,
                chosen_tier = decision.chosen_tier,
                provider = decision.provider.as_deref().unwrap_or("-"),
                escalated = decision.escalated,
                reason = %decision.reason,
                "router selected model"
            );
        }

        let attempts = node.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            // Input keys must exist before the agent runs. A miss is a
            // graph-design error, so no retry.
            let missing: Vec<String> = node
                .inputs
                .iter()
                .filter(|k| !state.contains(k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let e = WintermuteError::from(MissingStateError {
                    node_id: node.name.clone(),
                    missing_keys: missing,
                });
                tracing::error!(node_id = %node.name, error = %e, "required inputs absent");
                let mut event = node_event(&event_id, run_id, node, NodeStatus::Failed, attempt, 0.0, budget, &started_at);
                event.error = Some(e.to_string());
                return event;
            }

            if let Err(e) = budget.check(node.budget.as_ref()) {
                tracing::warn!(node_id = %node.name, error = %e, "budget exceeded");
                budget.degradation_active = true;
                budget.flag_human_review(format!("budget exceeded at node '{}': {e}", node.name));
                let mut event = node_event(&event_id, run_id, node, NodeStatus::BudgetDegraded, attempt, 0.0, budget, &started_at);
                event.error = Some(e.to_string());
                return event;
            }

            let t0 = Instant::now();
            match agent.run(state, client.as_ref()).await {
                Ok(outcome) => {
                    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
                    let (tokens_in, tokens_out) = (outcome.tokens_in, outcome.tokens_out);
                    let cost_usd = decision
                        .as_ref()
                        .and_then(|d| d.cost_per_1k_output)
                        .map(|cost| tokens_out as f64 / 1000.0 * cost)
                        .unwrap_or(0.0);
                    budget.record(tokens_in, tokens_out, cost_usd, &node.name);
                    state.insert(keys::BUDGET_USED_TOKENS, json!(budget.total_tokens()));
                    state.insert(keys::BUDGET_USED_COST, json!(budget.cost_usd));

                    // A QA gate failure arrives as data, not as an error. It
                    // only becomes a failure when a recovery edge exists.
                    let gate_failed = outcome.delta.get("gate_status").and_then(Value::as_str)
                        == Some("FAIL")
                        && node.on_fail.is_some();
                    let violation_count = outcome
                        .delta
                        .get("violations")
                        .and_then(Value::as_array)
                        .map(Vec::len)
                        .unwrap_or(0);
                    let delta_magnitude = outcome.delta.len();
                    state.merge_delta(outcome.delta);
                    self.metrics.record_delta_magnitude(delta_magnitude);

                    if gate_failed {
                        self.metrics.record_qa_failure(agent.id());
                        let message = format!("qa gate FAIL: {violation_count} violation(s)");
                        tracing::warn!(node_id = %node.name, message, "qa gate failed");
                        if attempt < attempts {
                            tokio::time::sleep(backoff(node, attempt)).await;
                            continue;
                        }
                        let mut event = node_event(&event_id, run_id, node, NodeStatus::Failed, attempt, latency_ms, budget, &started_at);
                        event.error = Some(message);
                        return event;
                    }

                    if let Some(decision) = &decision {
                        self.metrics.record_routing_decision(
                            decision.chosen_tier as i8,
                            decision.provider.as_deref(),
                            decision.escalated,
                            latency_ms,
                            None,
                            cost_usd,
                        );
                        self.metrics.record_model_call(decision.escalated);
                        self.persist_decision(
                            run_id, node, &agent, decision, latency_ms, tokens_in, tokens_out,
                            cost_usd,
                        )
                        .await;
                    }

                    let mut event = node_event(&event_id, run_id, node, NodeStatus::Success, attempt, latency_ms, budget, &started_at);
                    event.routing = decision.as_ref().map(|d| {
                        json!({
                            "model": d.model,
                            "provider": d.provider,
                            "chosen_tier": d.chosen_tier,
                            "escalated": d.escalated,
                            "reason": d.reason,
                        })
                    });
                    return event;
                }
                Err(e) => {
                    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
                    let retryable =
                        e.is_retryable() || matches!(e, WintermuteError::Validation(_));
                    tracing::warn!(
                        node_id = %node.name,
                        attempt,
                        attempts,
                        error = %e,
                        "node attempt failed"
                    );
                    if retryable && attempt < attempts {
                        tokio::time::sleep(backoff(node, attempt)).await;
                        continue;
                    }

                    let mut event = node_event(&event_id, run_id, node, NodeStatus::Failed, attempt, latency_ms, budget, &started_at);
                    if let WintermuteError::Routing(failure) = &e {
                        event.tried_providers = Some(failure.tried_providers.clone());
                    }
                    event.error = Some(e.to_string());
                    return event;
                }
            }
        }

        let mut event = node_event(&event_id, run_id, node, NodeStatus::Failed, attempts, 0.0, budget, &started_at);
        event.error = Some("exhausted retries".into());
        event
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_decision(
        &self,
        run_id: &str,
        node: &GraphNode,
        agent: &Arc<dyn Agent>,
        decision: &crate::router::RoutingDecision,
        latency_ms: f64,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    ) {
        let Some(store) = &self.store else { return };
        let record = RoutingDecisionRecord {
            decision_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: node.name.clone(),
            agent_id: agent.id().to_string(),
            request_tier: decision.request_tier,
            chosen_tier: decision.chosen_tier,
            provider: decision.provider.clone(),
            escalation_reason: decision.escalated.then(|| decision.reason.clone()),
            confidence: decision.confidence,
            complexity: decision.complexity,
            quality: None,
            latency_ms,
            tokens_in,
            tokens_out,
            cost_usd,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        // Best-effort: decision logging must never fail the run.
        if let Err(e) = store.insert_decision(&record).await {
            tracing::debug!(error = %e, "failed to persist routing decision");
        }
    }
}

fn backoff(node: &GraphNode, _attempt: u32) -> std::time::Duration {
    std::time::Duration::from_secs_f64(node.retry.backoff_seconds.max(0.0))
}

#[allow(clippy::too_many_arguments)]
fn node_event(
    event_id: &str,
    run_id: &str,
    node: &GraphNode,
    status: NodeStatus,
    attempt: u32,
    latency_ms: f64,
    budget: &BudgetLedger,
    started_at: &str,
) -> NodeEvent {
    NodeEvent {
        event_id: event_id.to_string(),
        run_id: run_id.to_string(),
        node_id: node.name.clone(),
        agent_id: node.agent.clone(),
        status,
        attempt,
        latency_ms,
        error: None,
        tried_providers: None,
        cost: budget.summary(),
        routing: None,
        started_at: started_at.to_string(),
    }
}
