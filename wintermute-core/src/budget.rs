//! Budget ledger: token/cost/wall-clock accounting with per-node caps,
//! degradation at 80% of any limit, and human-review flags.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::error::BudgetExceededError;
use crate::graph::NodeBudget;

/// Guidance injected into run state when budget pressure kicks in.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DegradationHint {
    pub max_sources: u32,
    pub max_questions: u32,
    pub skip_deep_synthesis: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeCost {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Accumulates cost across a run. Caps of zero are unlimited.
#[derive(Debug)]
pub struct BudgetLedger {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,

    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub max_wall_seconds: f64,

    /// Fraction of any cap at which degradation activates.
    pub degrade_at_fraction: f64,
    pub degradation_active: bool,
    degradation_hint: Option<DegradationHint>,

    pub needs_human_review: bool,
    review_reasons: Vec<String>,

    node_costs: HashMap<String, NodeCost>,
    started: Instant,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self {
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            max_tokens: 0,
            max_cost_usd: 0.0,
            max_wall_seconds: 0.0,
            degrade_at_fraction: 0.8,
            degradation_active: false,
            degradation_hint: None,
            needs_human_review: false,
            review_reasons: Vec::new(),
            node_costs: HashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn with_caps(max_tokens: u64, max_cost_usd: f64, max_wall_seconds: f64) -> Self {
        Self {
            max_tokens,
            max_cost_usd,
            max_wall_seconds,
            ..Self::new()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Record usage from a single agent call.
    pub fn record(&mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64, node_id: &str) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.cost_usd += cost_usd;

        if !node_id.is_empty() {
            let node = self.node_costs.entry(node_id.to_string()).or_default();
            node.tokens_in += tokens_in;
            node.tokens_out += tokens_out;
            node.cost_usd += cost_usd;
        }
    }

    /// Raise when any run-level or per-node cap is breached; otherwise update
    /// the degradation state for the 80% warning band.
    pub fn check(&mut self, node_budget: Option<&NodeBudget>) -> Result<(), BudgetExceededError> {
        let total_tokens = self.total_tokens();
        let elapsed = self.elapsed_seconds();

        if self.max_tokens > 0 && total_tokens >= self.max_tokens {
            return Err(BudgetExceededError {
                scope: "tokens".into(),
                limit: self.max_tokens as f64,
                current: total_tokens as f64,
            });
        }
        if self.max_cost_usd > 0.0 && self.cost_usd >= self.max_cost_usd {
            return Err(BudgetExceededError {
                scope: "cost_usd".into(),
                limit: self.max_cost_usd,
                current: self.cost_usd,
            });
        }
        if self.max_wall_seconds > 0.0 && elapsed >= self.max_wall_seconds {
            return Err(BudgetExceededError {
                scope: "wall_seconds".into(),
                limit: self.max_wall_seconds,
                current: elapsed,
            });
        }

        if let Some(nb) = node_budget {
            if nb.max_tokens > 0 && total_tokens >= nb.max_tokens {
                return Err(BudgetExceededError {
                    scope: "node_tokens".into(),
                    limit: nb.max_tokens as f64,
                    current: total_tokens as f64,
                });
            }
            if nb.max_cost_usd > 0.0 && self.cost_usd >= nb.max_cost_usd {
                return Err(BudgetExceededError {
                    scope: "node_cost".into(),
                    limit: nb.max_cost_usd,
                    current: self.cost_usd,
                });
            }
        }

        self.update_degradation(total_tokens, elapsed);
        Ok(())
    }

    fn update_degradation(&mut self, total_tokens: u64, elapsed: f64) {
        let fraction = self.degrade_at_fraction;
        let mut reasons: Vec<String> = Vec::new();

        if self.max_tokens > 0 && total_tokens as f64 >= self.max_tokens as f64 * fraction {
            reasons.push(format!("tokens at {}/{}", total_tokens, self.max_tokens));
        }
        if self.max_cost_usd > 0.0 && self.cost_usd >= self.max_cost_usd * fraction {
            reasons.push(format!(
                "cost at ${:.4}/${:.4}",
                self.cost_usd, self.max_cost_usd
            ));
        }
        if self.max_wall_seconds > 0.0 && elapsed >= self.max_wall_seconds * fraction {
            reasons.push(format!(
                "time at {:.0}s/{:.0}s",
                elapsed, self.max_wall_seconds
            ));
        }

        if !reasons.is_empty() {
            self.degradation_active = true;
            self.degradation_hint = Some(DegradationHint {
                max_sources: 3,
                max_questions: 5,
                skip_deep_synthesis: true,
                reason: reasons.join("; "),
            });
        }
    }

    pub fn degradation_hint(&self) -> Option<&DegradationHint> {
        if self.degradation_active {
            self.degradation_hint.as_ref()
        } else {
            None
        }
    }

    pub fn flag_human_review(&mut self, reason: impl Into<String>) {
        self.needs_human_review = true;
        self.review_reasons.push(reason.into());
    }

    pub fn review_reasons(&self) -> &[String] {
        &self.review_reasons
    }

    pub fn node_cost(&self, node_id: &str) -> NodeCost {
        self.node_costs.get(node_id).cloned().unwrap_or_default()
    }

    /// Serializable summary for events and checkpoints.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "tokens_in": self.tokens_in,
            "tokens_out": self.tokens_out,
            "cost_usd": (self.cost_usd * 1e6).round() / 1e6,
            "elapsed_seconds": (self.elapsed_seconds() * 100.0).round() / 100.0,
            "degradation_active": self.degradation_active,
            "needs_human_review": self.needs_human_review,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_token_cap_raises() {
        let mut ledger = BudgetLedger::with_caps(100, 0.0, 0.0);
        ledger.record(80, 30, 0.0, "extract");
        let err = ledger.check(None).unwrap_err();
        assert_eq!(err.scope, "tokens");
        assert_eq!(err.current, 110.0);
    }

    #[test]
    fn degradation_activates_at_eighty_percent() {
        let mut ledger = BudgetLedger::with_caps(100, 0.0, 0.0);
        ledger.record(50, 30, 0.0, "extract");
        ledger.check(None).unwrap();
        assert!(ledger.degradation_active);
        let hint = ledger.degradation_hint().unwrap();
        assert_eq!(hint.max_sources, 3);
        assert!(hint.skip_deep_synthesis);
        assert!(hint.reason.contains("tokens"));
    }

    #[test]
    fn below_threshold_no_degradation() {
        let mut ledger = BudgetLedger::with_caps(100, 0.0, 0.0);
        ledger.record(40, 30, 0.0, "extract");
        ledger.check(None).unwrap();
        assert!(!ledger.degradation_active);
        assert!(ledger.degradation_hint().is_none());
    }

    #[test]
    fn node_cap_raises_independently_of_run_cap() {
        let mut ledger = BudgetLedger::new();
        ledger.record(500, 500, 0.0, "synthesize");
        let node_budget = NodeBudget {
            max_tokens: 800,
            max_cost_usd: 0.0,
        };
        let err = ledger.check(Some(&node_budget)).unwrap_err();
        assert_eq!(err.scope, "node_tokens");
    }

    #[test]
    fn per_node_breakdown_accumulates() {
        let mut ledger = BudgetLedger::new();
        ledger.record(10, 5, 0.001, "extract");
        ledger.record(20, 10, 0.002, "extract");
        ledger.record(1, 1, 0.0, "publish");

        let extract = ledger.node_cost("extract");
        assert_eq!(extract.tokens_in, 30);
        assert_eq!(extract.tokens_out, 15);
        assert!((extract.cost_usd - 0.003).abs() < 1e-9);
        assert_eq!(ledger.node_cost("missing").tokens_in, 0);
    }

    #[test]
    fn human_review_flags_accumulate() {
        let mut ledger = BudgetLedger::new();
        assert!(!ledger.needs_human_review);
        ledger.flag_human_review("budget degraded at node 'synthesize'");
        assert!(ledger.needs_human_review);
        assert_eq!(ledger.review_reasons().len(), 1);
    }
}
