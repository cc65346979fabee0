//! Per-agent routing and constraint policies. Created at configuration load,
//! never mutated afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Routing + budget + constraint policy for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    /// Tier the agent normally runs at (0 = deterministic, no model call).
    #[serde(default = "default_preferred_tier")]
    pub preferred_tier: u8,
    /// Routing never chooses below this tier.
    #[serde(default)]
    pub min_tier: u8,
    /// Maximum output tokens per tier; falls back to `default_max_tokens`.
    #[serde(default)]
    pub max_tokens_by_tier: HashMap<u8, u32>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub allowed_local_models: Vec<String>,
    #[serde(default)]
    pub allowed_frontier_models: Vec<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub required_citations: bool,
}

fn default_preferred_tier() -> u8 {
    2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            preferred_tier: default_preferred_tier(),
            min_tier: 0,
            max_tokens_by_tier: HashMap::new(),
            default_max_tokens: default_max_tokens(),
            allowed_local_models: Vec::new(),
            allowed_frontier_models: Vec::new(),
            confidence_threshold: default_confidence_threshold(),
            required_citations: false,
        }
    }
}

impl AgentPolicy {
    pub fn max_tokens_for_tier(&self, tier: u8) -> u32 {
        self.max_tokens_by_tier
            .get(&tier)
            .copied()
            .unwrap_or(self.default_max_tokens)
    }

    pub fn allows_frontier(&self) -> bool {
        !self.allowed_frontier_models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_token_caps_fall_back_to_default() {
        let mut policy = AgentPolicy::default();
        policy.max_tokens_by_tier.insert(1, 128);
        assert_eq!(policy.max_tokens_for_tier(1), 128);
        assert_eq!(policy.max_tokens_for_tier(3), 4096);
    }

    #[test]
    fn frontier_permission_tracks_model_list() {
        let mut policy = AgentPolicy::default();
        assert!(!policy.allows_frontier());
        policy.allowed_frontier_models.push("cloud_a".into());
        assert!(policy.allows_frontier());
    }
}
