//! Error taxonomy for graph orchestration and agent failures.

#[derive(Debug, thiserror::Error)]
pub enum WintermuteError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("validation error: {0}")]
    Validation(#[from] AgentValidationError),

    #[error("missing state: {0}")]
    MissingState(#[from] MissingStateError),

    #[error("budget error: {0}")]
    Budget(#[from] BudgetExceededError),

    #[error("model error: {0}")]
    Model(#[from] ModelApiError),

    #[error("routing failure: {0}")]
    Routing(#[from] RoutingFailure),

    #[error("infra error: {0}")]
    Infra(#[from] InfraError),
}

impl WintermuteError {
    /// Whether the orchestrator's per-node retry loop should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WintermuteError::Model(e) if e.retryable)
    }
}

/// Malformed graph definition or traversal. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("entry node '{0}' not defined")]
    UnknownEntry(String),

    #[error("node '{node}' references undefined node '{target}' via {edge}")]
    DanglingEdge {
        node: String,
        target: String,
        edge: &'static str,
    },

    #[error("node '{0}' is unreachable from the entry node")]
    Unreachable(String),

    #[error("cannot resume: node '{0}' not on the main chain")]
    UnknownResumeNode(String),

    #[error("initial state missing required keys: {0:?}")]
    InvalidInitialState(Vec<String>),
}

/// Generic node execution failure.
#[derive(Debug, thiserror::Error)]
#[error("node '{node_id}': {message}")]
pub struct NodeError {
    pub node_id: String,
    pub message: String,
}

/// Agent output failed schema or business validation after full recovery.
#[derive(Debug, thiserror::Error)]
#[error("node '{node_id}': agent '{agent_id}' validation failed: {message}")]
pub struct AgentValidationError {
    pub node_id: String,
    pub agent_id: String,
    pub message: String,
}

/// Required state keys absent before node execution. Signals a graph-design bug.
#[derive(Debug, thiserror::Error)]
#[error("node '{node_id}': missing state keys: {missing_keys:?}")]
pub struct MissingStateError {
    pub node_id: String,
    pub missing_keys: Vec<String>,
}

/// A hard budget cap was breached.
#[derive(Debug, thiserror::Error)]
#[error("budget exceeded for {scope}: {current:.2} >= {limit:.2}")]
pub struct BudgetExceededError {
    pub scope: String,
    pub limit: f64,
    pub current: f64,
}

/// Model API call failed. `retryable` separates transient (timeout, 5xx,
/// rate limit) from permanent (4xx, shape mismatch) failures.
#[derive(Debug, thiserror::Error)]
#[error("model '{model}': {message}")]
pub struct ModelApiError {
    pub model: String,
    pub message: String,
    pub retryable: bool,
}

impl ModelApiError {
    pub fn transient(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// All candidate providers exhausted at a tier.
#[derive(Debug, thiserror::Error)]
#[error("tier {tier} exhausted, tried providers: {tried_providers:?}")]
pub struct RoutingFailure {
    pub tier: u8,
    pub tried_providers: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serde(String),
}
