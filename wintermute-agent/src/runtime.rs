//! The agent contract and the LLM lifecycle driver.
//!
//! An agent is a value with an id, a version, a policy, prompt templates, and
//! pure `parse`/`validate` functions. The default `run` drives the full
//! lifecycle: prompt assembly → model call → deterministic JSON repair →
//! parse + validate → same-model re-ask → repair-prompt retries. Deterministic
//! agents override `run` and never touch the model client.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use wintermute_core::error::{AgentValidationError, MissingStateError, WintermuteError};
use wintermute_core::policy::AgentPolicy;
use wintermute_core::state::{DeltaState, RunState};

use crate::client::ModelClient;
use crate::repair::{extract_json, repair_json};

/// How many repair-prompt retries follow the same-model re-ask.
const REPAIR_RETRY_ATTEMPTS: usize = 2;

/// Result of one agent execution: the delta to merge plus the token usage
/// accumulated across every model call the lifecycle made.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub delta: DeltaState,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl AgentOutcome {
    pub fn deterministic(delta: DeltaState) -> Self {
        Self {
            delta,
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
    fn policy(&self) -> &AgentPolicy;

    fn system_prompt(&self) -> &str {
        ""
    }

    /// User-message template with `{key}` placeholders resolved from state.
    fn user_template(&self) -> &str {
        ""
    }

    /// Human-readable description of the output schema, quoted back to the
    /// model during recovery re-asks.
    fn schema_hint(&self) -> String;

    /// Parse repaired JSON text into a delta. Pure.
    fn parse(&self, raw: &str) -> Result<DeltaState, String>;

    /// Validate a parsed delta. Pure.
    fn validate(&self, delta: &DeltaState) -> Result<(), String>;

    async fn run(
        &self,
        state: &RunState,
        client: &dyn ModelClient,
    ) -> Result<AgentOutcome, WintermuteError> {
        run_llm_lifecycle(self, state, client).await
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"))
}

/// Substitute `{key}` placeholders from state. String values are inserted
/// as-is, everything else as compact JSON. An unresolved placeholder is a
/// graph-design error scoped to the node being executed.
pub fn render_template(
    template: &str,
    state: &RunState,
    node_id: &str,
) -> Result<String, MissingStateError> {
    let mut missing: Vec<String> = Vec::new();
    let rendered = placeholder_pattern().replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match state.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(MissingStateError {
            node_id: node_id.to_string(),
            missing_keys: missing,
        })
    }
}

/// Citation invariant: every object item in every produced list must carry a
/// non-empty `citations` array of non-empty ids. Applied when the agent's
/// policy flags citations as required.
pub fn enforce_citations(delta: &DeltaState) -> Result<(), String> {
    for (key, value) in delta {
        let Some(items) = value.as_array() else {
            continue;
        };
        for (idx, item) in items.iter().enumerate() {
            let Some(object) = item.as_object() else {
                continue;
            };
            let cited = object
                .get("citations")
                .and_then(Value::as_array)
                .map(|c| {
                    !c.is_empty()
                        && c.iter()
                            .all(|v| v.as_str().is_some_and(|s| !s.is_empty()))
                })
                .unwrap_or(false);
            if !cited {
                return Err(format!("item {idx} in '{key}' has no citations"));
            }
        }
    }
    Ok(())
}

fn parse_attempt<A: Agent + ?Sized>(agent: &A, raw: &str) -> Result<DeltaState, String> {
    let repaired = repair_json(extract_json(raw));
    let delta = agent.parse(&repaired)?;
    agent.validate(&delta)?;
    if agent.policy().required_citations {
        enforce_citations(&delta)?;
    }
    Ok(delta)
}

/// The three-stage LLM lifecycle shared by every non-deterministic agent.
pub async fn run_llm_lifecycle<A: Agent + ?Sized>(
    agent: &A,
    state: &RunState,
    client: &dyn ModelClient,
) -> Result<AgentOutcome, WintermuteError> {
    let system_prompt = agent.system_prompt().to_string();
    // The orchestrator stamps the executing node into state; outside a graph
    // walk the agent id is the best scope available.
    let node_id = state.current_node_or(agent.id()).to_string();
    let user_message = render_template(agent.user_template(), state, &node_id)?;

    let mut tokens_in = 0u64;
    let mut tokens_out = 0u64;

    let reply = client
        .call(&system_prompt, &user_message)
        .await
        .map_err(WintermuteError::Model)?;
    tokens_in += reply.tokens_in;
    tokens_out += reply.tokens_out;

    let mut raw = reply.text;
    let mut last_error = match parse_attempt(agent, &raw) {
        Ok(delta) => {
            return Ok(finish(delta, tokens_in, tokens_out));
        }
        Err(e) => e,
    };

    // Stage two: same-model re-ask carrying the raw output, the schema, and
    // the parser error.
    tracing::warn!(
        agent_id = %agent.id(),
        error = %last_error,
        "deterministic repair failed, re-asking model"
    );
    let schema = agent.schema_hint();
    let reask = format!(
        "Your previous output failed to parse.\n\nExpected schema:\n{schema}\n\n\
         Parser error: {last_error}\n\nPrevious output:\n{raw}\n\n\
         Return the corrected JSON only."
    );
    match client.call(RECOVERY_SYSTEM_PROMPT, &reask).await {
        Ok(reply) => {
            tokens_in += reply.tokens_in;
            tokens_out += reply.tokens_out;
            raw = reply.text;
            match parse_attempt(agent, &raw) {
                Ok(delta) => return Ok(finish(delta, tokens_in, tokens_out)),
                Err(e) => last_error = e,
            }
        }
        Err(e) => last_error = e.to_string(),
    }

    // Stage three: bounded repair-prompt retries with escalating sternness.
    for attempt in 1..=REPAIR_RETRY_ATTEMPTS {
        let sternness = if attempt == REPAIR_RETRY_ATTEMPTS {
            "FINAL ATTEMPT. Respond with EXACTLY one valid JSON object and nothing else. \
             No prose, no code fences, no explanation."
        } else {
            "Output ONLY valid JSON matching the schema. No prose, no code fences."
        };
        let retry_message = format!(
            "{sternness}\n\nExpected schema:\n{schema}\n\nParser error: {last_error}\n\n\
             Previous output:\n{raw}"
        );
        tracing::warn!(
            agent_id = %agent.id(),
            attempt,
            error = %last_error,
            "repair-prompt retry"
        );
        match client.call(RECOVERY_SYSTEM_PROMPT, &retry_message).await {
            Ok(reply) => {
                tokens_in += reply.tokens_in;
                tokens_out += reply.tokens_out;
                raw = reply.text;
                match parse_attempt(agent, &raw) {
                    Ok(delta) => return Ok(finish(delta, tokens_in, tokens_out)),
                    Err(e) => last_error = e,
                }
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(AgentValidationError {
        node_id,
        agent_id: agent.id().to_string(),
        message: last_error,
    }
    .into())
}

const RECOVERY_SYSTEM_PROMPT: &str =
    "You repair malformed JSON output. Return only the corrected JSON, nothing else.";

fn finish(mut delta: DeltaState, tokens_in: u64, tokens_out: u64) -> AgentOutcome {
    // Mirror the agent's self-reported confidence into the router signal key.
    if let Some(confidence) = delta.get("confidence").and_then(Value::as_f64) {
        delta.insert(
            wintermute_core::state::keys::LAST_CONFIDENCE.to_string(),
            Value::from(confidence),
        );
    }
    AgentOutcome {
        delta,
        tokens_in,
        tokens_out,
    }
}

/// A prompted agent declared from data: prompts, policy, and the output keys
/// its schema requires. Domain agents are thin instances of this.
pub struct GenericJsonAgent {
    id: String,
    version: String,
    policy: AgentPolicy,
    system_prompt: String,
    user_template: String,
    required_output_keys: Vec<String>,
}

impl GenericJsonAgent {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: "0.1.0".into(),
            policy: AgentPolicy::default(),
            system_prompt: system_prompt.into(),
            user_template: String::new(),
            required_output_keys: Vec::new(),
        }
    }

    pub fn with_user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    pub fn with_policy(mut self, policy: AgentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_required_outputs(mut self, keys: &[&str]) -> Self {
        self.required_output_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

#[async_trait]
impl Agent for GenericJsonAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn user_template(&self) -> &str {
        &self.user_template
    }

    fn schema_hint(&self) -> String {
        if self.required_output_keys.is_empty() {
            "a single JSON object".to_string()
        } else {
            format!(
                "a single JSON object with keys: {}",
                self.required_output_keys.join(", ")
            )
        }
    }

    fn parse(&self, raw: &str) -> Result<DeltaState, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(format!("expected a JSON object, got {other}")),
        }
    }

    fn validate(&self, delta: &DeltaState) -> Result<(), String> {
        for key in &self.required_output_keys {
            match delta.get(key) {
                None | Some(Value::Null) => return Err(format!("missing output key '{key}'")),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Deterministic agent backed by a plain function. Never calls the model.
pub struct FnAgent {
    id: String,
    version: String,
    policy: AgentPolicy,
    #[allow(clippy::type_complexity)]
    func: Box<dyn Fn(&RunState) -> Result<DeltaState, String> + Send + Sync>,
}

impl FnAgent {
    pub fn new(
        id: impl Into<String>,
        func: impl Fn(&RunState) -> Result<DeltaState, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            version: "0.1.0".into(),
            policy: AgentPolicy {
                preferred_tier: 0,
                ..AgentPolicy::default()
            },
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    fn schema_hint(&self) -> String {
        "deterministic".into()
    }

    fn parse(&self, _raw: &str) -> Result<DeltaState, String> {
        Err("deterministic agent has no parse stage".into())
    }

    fn validate(&self, _delta: &DeltaState) -> Result<(), String> {
        Ok(())
    }

    async fn run(
        &self,
        state: &RunState,
        _client: &dyn ModelClient,
    ) -> Result<AgentOutcome, WintermuteError> {
        let delta = (self.func)(state).map_err(|message| AgentValidationError {
            node_id: state.current_node_or(&self.id).to_string(),
            agent_id: self.id.clone(),
            message,
        })?;
        Ok(AgentOutcome::deterministic(delta))
    }
}
