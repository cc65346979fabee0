//! Model router: maps an agent policy plus run-state signals to a tier and
//! concrete adapter, recording why.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use wintermute_agent::client::ModelClient;
use wintermute_core::config::{load_router_config, RouterConfig};
use wintermute_core::error::WintermuteError;
use wintermute_core::policy::AgentPolicy;
use wintermute_core::state::{keys, RunState};

use crate::providers::{ProviderRegistry, SelectionStrategy, TaskRequirements};

/// Slot names for the fixed tier adapters.
pub const SLOT_TIER1: &str = "tier1";
pub const SLOT_TIER2: &str = "tier2";

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub request_tier: u8,
    pub chosen_tier: u8,
    pub model: String,
    pub provider: Option<String>,
    pub reason: String,
    pub escalated: bool,
    pub composite_score: f64,
    pub confidence: Option<f64>,
    pub complexity: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
}

/// Escalation signals pulled from reserved state keys.
#[derive(Debug, Clone, Copy, Default)]
struct Signals {
    confidence: Option<f64>,
    complexity: Option<f64>,
    contradiction_ambiguity: f64,
    missing_citations: u64,
}

impl Signals {
    fn from_state(state: &RunState) -> Self {
        Self {
            confidence: state.f64_value(keys::LAST_CONFIDENCE),
            complexity: state.f64_value(keys::SYNTHESIS_COMPLEXITY),
            contradiction_ambiguity: state
                .f64_value(keys::CONTRADICTION_AMBIGUITY)
                .unwrap_or(0.0),
            missing_citations: state.u64_value(keys::MISSING_CITATIONS_COUNT).unwrap_or(0),
        }
    }

    /// Hallucination risk saturates after three repeated citation misses, and
    /// unresolved contradictions count as risk too.
    fn hallucination_risk(&self) -> f64 {
        let citation_risk = (self.missing_citations as f64 / 3.0).min(1.0);
        citation_risk.max(self.contradiction_ambiguity)
    }
}

pub struct ModelRouter {
    config: RwLock<RouterConfig>,
    /// Fixed tier-1/tier-2 adapters by slot name. Never replaced by reload.
    adapters: HashMap<String, Arc<dyn ModelClient>>,
    registry: Arc<ProviderRegistry>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            config: RwLock::new(config),
            adapters: HashMap::new(),
            registry,
        }
    }

    pub fn with_adapter(mut self, slot: &str, client: Arc<dyn ModelClient>) -> Self {
        self.adapters.insert(slot.to_string(), client);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Re-read thresholds and tier configs from disk. Adapters are kept.
    pub fn reload_config(&self, path: &str) -> Result<(), WintermuteError> {
        let fresh = load_router_config(path)?;
        let mut config = self.config.write().expect("router config lock");
        *config = fresh;
        tracing::info!(path, "router config reloaded");
        Ok(())
    }

    pub fn config_snapshot(&self) -> RouterConfig {
        self.config.read().expect("router config lock").clone()
    }

    /// Choose a tier (and provider, for tier 3) for one agent invocation.
    pub fn select_model(&self, policy: &AgentPolicy, state: &RunState) -> RoutingDecision {
        let config = self.config.read().expect("router config lock");

        if policy.preferred_tier == 0 {
            return RoutingDecision {
                request_tier: 0,
                chosen_tier: 0,
                model: "none".into(),
                provider: None,
                reason: "deterministic agent, no model call".into(),
                escalated: false,
                composite_score: 0.0,
                confidence: None,
                complexity: None,
                cost_per_1k_output: None,
            };
        }

        let signals = Signals::from_state(state);
        let confidence = signals.confidence.unwrap_or(1.0);
        let complexity = signals.complexity.unwrap_or(0.0);
        let risk = signals.hallucination_risk();
        let score = config.escalation.routing_score(complexity, confidence, risk);

        let mut reasons: Vec<String> = Vec::new();
        if confidence < policy.confidence_threshold {
            reasons.push(format!(
                "confidence {confidence:.2} below threshold {:.2}",
                policy.confidence_threshold
            ));
        }
        if complexity > config.escalation.complexity_threshold {
            reasons.push(format!(
                "complexity {complexity:.2} above threshold {:.2}",
                config.escalation.complexity_threshold
            ));
        }
        if signals.missing_citations >= 3 {
            reasons.push(format!(
                "{} repeated citation misses",
                signals.missing_citations
            ));
        }
        if score > config.escalation.routing_score_threshold {
            reasons.push(format!(
                "composite score {score:.2} above threshold {:.2}",
                config.escalation.routing_score_threshold
            ));
        }

        let escalated = !reasons.is_empty();
        let mut chosen = if escalated {
            (policy.preferred_tier + 1).min(3)
        } else {
            policy.preferred_tier
        };
        chosen = chosen.max(policy.min_tier);

        let reason = if escalated {
            reasons.join("; ")
        } else {
            "preferred tier within thresholds".into()
        };

        let (model, provider, cost) = match chosen {
            1 => (config.tier1.model.clone(), None, None),
            2 => (config.tier2.model.clone(), None, None),
            3 => {
                let strategy = SelectionStrategy::from_str(&config.selection_strategy)
                    .unwrap_or(SelectionStrategy::PreferLocal);
                let req = TaskRequirements {
                    min_context: estimate_prompt_tokens(state),
                    ..TaskRequirements::default()
                };
                match self.registry.select(&req, strategy) {
                    Some(entry) => (
                        entry.model.clone(),
                        Some(entry.name.clone()),
                        Some(entry.cost_per_1k_output),
                    ),
                    None => (config.tier2.model.clone(), None, None),
                }
            }
            _ => (config.tier1.model.clone(), None, None),
        };

        let decision = RoutingDecision {
            request_tier: policy.preferred_tier,
            chosen_tier: chosen,
            model,
            provider,
            reason,
            escalated,
            composite_score: score,
            confidence: signals.confidence,
            complexity: signals.complexity,
            cost_per_1k_output: cost,
        };
        tracing::debug!(
            request_tier = decision.request_tier,
            chosen_tier = decision.chosen_tier,
            provider = decision.provider.as_deref().unwrap_or("-"),
            reason = %decision.reason,
            "routing decision"
        );
        decision
    }

    /// The concrete adapter for a decision, or `None` for tier 0 and for
    /// slots that were never attached.
    pub fn callable_for(&self, decision: &RoutingDecision) -> Option<Arc<dyn ModelClient>> {
        match decision.chosen_tier {
            0 => None,
            1 => self.adapters.get(SLOT_TIER1).cloned(),
            2 => self.adapters.get(SLOT_TIER2).cloned(),
            _ => decision
                .provider
                .as_deref()
                .and_then(|name| self.registry.get(name))
                .map(|entry| entry.client),
        }
    }
}

/// Rough prompt-size estimate from the serialized state, used as the
/// min-context requirement for tier-3 selection.
fn estimate_prompt_tokens(state: &RunState) -> u32 {
    let serialized_len = serde_json::to_string(state.as_map())
        .map(|s| s.len())
        .unwrap_or(0);
    (serialized_len / 4).min(u32::MAX as usize) as u32
}
