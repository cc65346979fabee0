//! Router configuration loaded from YAML: tier configs, the tier-3 provider
//! list, escalation criteria, and dispatch limits.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{InfraError, WintermuteError};

/// Per-tier model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub model: String,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_tier_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_num_ctx() -> u32 {
    4096
}

fn default_tier_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.2
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_concurrency() -> u32 {
    4
}

impl TierConfig {
    pub fn tier1_default() -> Self {
        Self {
            model: "micro".into(),
            num_ctx: 2048,
            max_tokens: 128,
            temperature: 0.1,
            timeout_seconds: 5.0,
            concurrency: 8,
        }
    }

    pub fn tier2_default() -> Self {
        Self {
            model: "light".into(),
            num_ctx: 8192,
            max_tokens: 1024,
            temperature: 0.2,
            timeout_seconds: 30.0,
            concurrency: 4,
        }
    }
}

/// One tier-3 provider as declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Adapter flavor: `local`, `dgx`, `anthropic`, `openai`.
    pub kind: String,
    pub model: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
    #[serde(default = "default_quality")]
    pub quality_score: f64,
    #[serde(default = "default_max_context")]
    pub max_context: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-provider daily call cap; zero means only the aggregate cap applies.
    #[serde(default)]
    pub daily_cap: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: f64,
}

fn default_quality() -> f64 {
    0.5
}

fn default_max_context() -> u32 {
    8192
}

fn default_provider_timeout() -> f64 {
    120.0
}

/// Composite-score weights: `complexity*w1 + (1-confidence)*w2 + risk*w3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_w_complexity")]
    pub complexity: f64,
    #[serde(default = "default_w_inverse_confidence")]
    pub inverse_confidence: f64,
    #[serde(default = "default_w_hallucination_risk")]
    pub hallucination_risk: f64,
}

fn default_w_complexity() -> f64 {
    0.4
}

fn default_w_inverse_confidence() -> f64 {
    0.3
}

fn default_w_hallucination_risk() -> f64 {
    0.3
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            complexity: default_w_complexity(),
            inverse_confidence: default_w_inverse_confidence(),
            hallucination_risk: default_w_hallucination_risk(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationCriteria {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: f64,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_reasoning_depth_threshold")]
    pub reasoning_depth_threshold: u32,
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default = "default_routing_score_threshold")]
    pub routing_score_threshold: f64,
}

fn default_min_confidence() -> f64 {
    0.75
}

fn default_complexity_threshold() -> f64 {
    0.7
}

fn default_quality_threshold() -> f64 {
    0.70
}

fn default_reasoning_depth_threshold() -> u32 {
    4
}

fn default_routing_score_threshold() -> f64 {
    0.5
}

impl Default for EscalationCriteria {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            complexity_threshold: default_complexity_threshold(),
            quality_threshold: default_quality_threshold(),
            reasoning_depth_threshold: default_reasoning_depth_threshold(),
            weights: ScoreWeights::default(),
            routing_score_threshold: default_routing_score_threshold(),
        }
    }
}

impl EscalationCriteria {
    /// Composite routing score from the three escalation signals.
    pub fn routing_score(
        &self,
        complexity: f64,
        confidence: f64,
        hallucination_risk: f64,
    ) -> f64 {
        complexity * self.weights.complexity
            + (1.0 - confidence) * self.weights.inverse_confidence
            + hallucination_risk * self.weights.hallucination_risk
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "TierConfig::tier1_default")]
    pub tier1: TierConfig,
    #[serde(default = "TierConfig::tier2_default")]
    pub tier2: TierConfig,
    #[serde(default)]
    pub tier3_providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub escalation: EscalationCriteria,
    #[serde(default = "default_strategy")]
    pub selection_strategy: String,
    #[serde(default = "default_daily_frontier_cap")]
    pub daily_frontier_cap: u32,
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
}

fn default_strategy() -> String {
    "prefer_local".into()
}

fn default_daily_frontier_cap() -> u32 {
    100
}

fn default_max_input_length() -> usize {
    10_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tier1: TierConfig::tier1_default(),
            tier2: TierConfig::tier2_default(),
            tier3_providers: Vec::new(),
            escalation: EscalationCriteria::default(),
            selection_strategy: default_strategy(),
            daily_frontier_cap: default_daily_frontier_cap(),
            max_input_length: default_max_input_length(),
        }
    }
}

pub fn load_router_config(path: impl AsRef<Path>) -> Result<RouterConfig, WintermuteError> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(InfraError::Io)?;
    let config: RouterConfig =
        serde_yaml::from_str(&raw).map_err(|e| InfraError::Config(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dispatch_limits() {
        let config = RouterConfig::default();
        assert_eq!(config.tier1.timeout_seconds, 5.0);
        assert_eq!(config.tier1.concurrency, 8);
        assert_eq!(config.tier2.timeout_seconds, 30.0);
        assert_eq!(config.tier2.concurrency, 4);
        assert_eq!(config.escalation.routing_score_threshold, 0.5);
        assert_eq!(config.max_input_length, 10_000);
    }

    #[test]
    fn routing_score_uses_default_weights() {
        let criteria = EscalationCriteria::default();
        // complexity 0.9 * 0.4 + (1 - 0.5) * 0.3 + risk 1.0 * 0.3 = 0.81
        let score = criteria.routing_score(0.9, 0.5, 1.0);
        assert!((score - 0.81).abs() < 1e-9);
        assert!(score > criteria.routing_score_threshold);
    }

    #[test]
    fn loads_yaml_with_partial_sections() {
        let yaml = r#"
tier1:
  model: deepseek-r1:1.5b
  timeout_seconds: 3.0
tier3_providers:
  - name: cloud_a
    kind: anthropic
    model: big-sonnet
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    quality_score: 0.95
    max_context: 200000
    tags: [cloud, frontier]
    daily_cap: 40
escalation:
  min_confidence: 0.8
selection_strategy: cheapest_qualified
daily_frontier_cap: 60
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = load_router_config(&path).unwrap();
        assert_eq!(config.tier1.model, "deepseek-r1:1.5b");
        assert_eq!(config.tier1.timeout_seconds, 3.0);
        assert_eq!(config.tier1.concurrency, 8); // default preserved
        assert_eq!(config.tier2.model, "light"); // whole section defaulted
        assert_eq!(config.tier3_providers.len(), 1);
        assert_eq!(config.tier3_providers[0].daily_cap, 40);
        assert_eq!(config.escalation.min_confidence, 0.8);
        assert_eq!(config.escalation.weights.complexity, 0.4);
        assert_eq!(config.daily_frontier_cap, 60);
    }
}
