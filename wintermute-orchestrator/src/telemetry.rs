//! In-memory metrics for runs and routing, shared process-wide behind a
//! mutex. Snapshots serialize for the dashboard; persistence is optional and
//! best-effort.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use wintermute_core::redact::redact_value;

#[derive(Default)]
struct MetricsInner {
    run_durations: Vec<f64>,
    token_usage: Vec<u64>,
    frontier_calls: u64,
    local_calls: u64,
    qa_failures: HashMap<String, u64>,
    delta_magnitudes: Vec<f64>,

    decisions: u64,
    escalations: u64,
    tier_counts: HashMap<i8, u64>,
    provider_counts: HashMap<String, u64>,
    provider_cost: HashMap<String, f64>,
    latency_by_tier: HashMap<i8, Vec<f64>>,
    quality_by_tier: HashMap<i8, Vec<f64>>,

    events: Vec<Value>,
}

/// Process-wide metrics collector.
#[derive(Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_duration(&self, seconds: f64) {
        self.locked().run_durations.push(seconds);
    }

    pub fn record_token_usage(&self, tokens: u64) {
        self.locked().token_usage.push(tokens);
    }

    pub fn record_model_call(&self, escalated: bool) {
        let mut inner = self.locked();
        if escalated {
            inner.frontier_calls += 1;
        } else {
            inner.local_calls += 1;
        }
    }

    pub fn record_qa_failure(&self, agent_id: &str) {
        *self.locked().qa_failures.entry(agent_id.to_string()).or_default() += 1;
    }

    pub fn record_delta_magnitude(&self, magnitude: usize) {
        self.locked().delta_magnitudes.push(magnitude as f64);
    }

    pub fn record_routing_decision(
        &self,
        chosen_tier: i8,
        provider: Option<&str>,
        escalated: bool,
        latency_ms: f64,
        quality: Option<f64>,
        cost_usd: f64,
    ) {
        let mut inner = self.locked();
        inner.decisions += 1;
        if escalated {
            inner.escalations += 1;
        }
        *inner.tier_counts.entry(chosen_tier).or_default() += 1;
        if let Some(provider) = provider {
            *inner.provider_counts.entry(provider.to_string()).or_default() += 1;
            *inner.provider_cost.entry(provider.to_string()).or_default() += cost_usd;
        }
        inner
            .latency_by_tier
            .entry(chosen_tier)
            .or_default()
            .push(latency_ms);
        if let Some(quality) = quality {
            inner
                .quality_by_tier
                .entry(chosen_tier)
                .or_default()
                .push(quality);
        }
    }

    /// Append a structured event, scrubbing credential-shaped values first.
    pub fn emit_event(&self, mut event: Value) {
        redact_value(&mut event);
        tracing::info!(event = %event, "pipeline event");
        self.locked().events.push(event);
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Value> {
        let inner = self.locked();
        let start = inner.events.len().saturating_sub(limit);
        inner.events[start..].to_vec()
    }

    pub fn frontier_usage_rate(&self) -> f64 {
        let inner = self.locked();
        let total = inner.frontier_calls + inner.local_calls;
        if total == 0 {
            0.0
        } else {
            inner.frontier_calls as f64 / total as f64
        }
    }

    pub fn escalation_rate(&self) -> f64 {
        let inner = self.locked();
        if inner.decisions == 0 {
            0.0
        } else {
            inner.escalations as f64 / inner.decisions as f64
        }
    }

    pub fn snapshot(&self) -> Value {
        let inner = self.locked();
        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                0.0
            } else {
                xs.iter().sum::<f64>() / xs.len() as f64
            }
        };

        let tier_distribution: HashMap<String, u64> = inner
            .tier_counts
            .iter()
            .map(|(tier, count)| (tier.to_string(), *count))
            .collect();
        let avg_latency_by_tier: HashMap<String, f64> = inner
            .latency_by_tier
            .iter()
            .map(|(tier, xs)| (tier.to_string(), avg(xs)))
            .collect();
        let avg_quality_by_tier: HashMap<String, f64> = inner
            .quality_by_tier
            .iter()
            .map(|(tier, xs)| (tier.to_string(), avg(xs)))
            .collect();

        let total = inner.frontier_calls + inner.local_calls;
        let frontier_rate = if total == 0 {
            0.0
        } else {
            inner.frontier_calls as f64 / total as f64
        };
        let escalation_rate = if inner.decisions == 0 {
            0.0
        } else {
            inner.escalations as f64 / inner.decisions as f64
        };

        json!({
            "run_count": inner.run_durations.len(),
            "avg_run_duration": avg(&inner.run_durations),
            "total_tokens": inner.token_usage.iter().sum::<u64>(),
            "frontier_calls": inner.frontier_calls,
            "local_calls": inner.local_calls,
            "frontier_usage_rate": frontier_rate,
            "qa_failures_by_agent": inner.qa_failures,
            "avg_delta_magnitude": avg(&inner.delta_magnitudes),
            "routing": {
                "decisions": inner.decisions,
                "escalation_rate": escalation_rate,
                "tier_distribution": tier_distribution,
                "provider_distribution": inner.provider_counts,
                "cost_by_provider": inner.provider_cost,
                "avg_latency_ms_by_tier": avg_latency_by_tier,
                "avg_quality_by_tier": avg_quality_by_tier,
            },
        })
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_metrics_aggregate() {
        let metrics = MetricsCollector::new();
        metrics.record_routing_decision(1, None, false, 120.0, Some(0.9), 0.0);
        metrics.record_routing_decision(2, None, true, 800.0, Some(0.7), 0.0);
        metrics.record_routing_decision(3, Some("cloud_a"), true, 2500.0, None, 0.02);
        metrics.record_routing_decision(3, Some("cloud_a"), true, 1500.0, None, 0.03);

        assert_eq!(metrics.escalation_rate(), 0.75);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["routing"]["decisions"], 4);
        assert_eq!(snapshot["routing"]["tier_distribution"]["3"], 2);
        assert_eq!(snapshot["routing"]["provider_distribution"]["cloud_a"], 2);
        let cost = snapshot["routing"]["cost_by_provider"]["cloud_a"]
            .as_f64()
            .unwrap();
        assert!((cost - 0.05).abs() < 1e-9);
        let latency = snapshot["routing"]["avg_latency_ms_by_tier"]["3"]
            .as_f64()
            .unwrap();
        assert!((latency - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn frontier_rate_counts_escalated_calls() {
        let metrics = MetricsCollector::new();
        metrics.record_model_call(false);
        metrics.record_model_call(false);
        metrics.record_model_call(true);
        assert!((metrics.frontier_usage_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn events_are_redacted_before_storage() {
        let metrics = MetricsCollector::new();
        metrics.emit_event(json!({
            "node_id": "publish",
            "api_key": "sk-abcdefghijklmnopqrstuv",
        }));
        let events = metrics.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["api_key"], json!("[REDACTED]"));
    }

    #[test]
    fn qa_failures_group_by_agent() {
        let metrics = MetricsCollector::new();
        metrics.record_qa_failure("qa_validator");
        metrics.record_qa_failure("qa_validator");
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["qa_failures_by_agent"]["qa_validator"], 2);
    }
}
