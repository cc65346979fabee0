//! Routing-decision analysis: over/under-escalation detection, cost
//! breakdowns by provider, and threshold suggestions.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use wintermute_orchestrator::store::RoutingDecisionRecord;

/// High-confidence requests that were still escalated above their requested
/// tier. Each one is a candidate for raising the confidence threshold.
pub fn over_escalations(
    decisions: &[RoutingDecisionRecord],
    confidence_threshold: f64,
) -> Vec<Value> {
    decisions
        .iter()
        .filter_map(|d| {
            let confidence = d.confidence?;
            if confidence >= confidence_threshold && d.chosen_tier > d.request_tier {
                Some(json!({
                    "decision_id": d.decision_id,
                    "agent_id": d.agent_id,
                    "confidence": confidence,
                    "request_tier": d.request_tier,
                    "chosen_tier": d.chosen_tier,
                    "reason": d.escalation_reason,
                    "suggestion": format!(
                        "confidence {confidence:.2} >= {confidence_threshold} — could have stayed at tier {}",
                        d.request_tier
                    ),
                }))
            } else {
                None
            }
        })
        .collect()
}

/// Low-quality results that came out of the requested tier or lower.
pub fn under_escalations(
    decisions: &[RoutingDecisionRecord],
    quality_threshold: f64,
) -> Vec<Value> {
    decisions
        .iter()
        .filter_map(|d| {
            let quality = d.quality?;
            if quality < quality_threshold && d.chosen_tier <= d.request_tier {
                Some(json!({
                    "decision_id": d.decision_id,
                    "agent_id": d.agent_id,
                    "quality_score": quality,
                    "chosen_tier": d.chosen_tier,
                    "suggestion": format!(
                        "quality {quality:.2} < {quality_threshold} — consider escalating from tier {}",
                        d.chosen_tier
                    ),
                }))
            } else {
                None
            }
        })
        .collect()
}

pub fn cost_analysis(decisions: &[RoutingDecisionRecord]) -> Value {
    let mut costs: BTreeMap<String, f64> = BTreeMap::new();
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut latencies: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for d in decisions {
        let provider = d.provider.clone().unwrap_or_else(|| "unknown".into());
        *costs.entry(provider.clone()).or_default() += d.cost_usd;
        *counts.entry(provider.clone()).or_default() += 1;
        latencies.entry(provider).or_default().push(d.latency_ms);
    }

    let avg_cost: BTreeMap<String, f64> = counts
        .iter()
        .map(|(p, n)| (p.clone(), costs[p] / *n as f64))
        .collect();
    let avg_latency: BTreeMap<String, f64> = latencies
        .iter()
        .map(|(p, xs)| (p.clone(), xs.iter().sum::<f64>() / xs.len() as f64))
        .collect();

    json!({
        "total_cost_by_provider": costs,
        "call_count_by_provider": counts,
        "avg_cost_per_call": avg_cost,
        "avg_latency_ms": avg_latency,
    })
}

/// Recommend threshold adjustments from the observed distributions.
pub fn suggest_thresholds(decisions: &[RoutingDecisionRecord]) -> Value {
    let mut suggestions = serde_json::Map::new();

    let confidences: Vec<f64> = decisions.iter().filter_map(|d| d.confidence).collect();
    if !confidences.is_empty() {
        let avg = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let suggested = ((avg - 0.05).clamp(0.5, 0.9) * 100.0).round() / 100.0;
        suggestions.insert(
            "confidence_threshold".into(),
            json!({
                "current_avg": avg,
                "suggested": suggested,
                "reasoning": format!(
                    "average confidence is {avg:.2}; suggested threshold {suggested}"
                ),
            }),
        );
    }

    let qualities: Vec<f64> = decisions.iter().filter_map(|d| d.quality).collect();
    if !qualities.is_empty() {
        let avg = qualities.iter().sum::<f64>() / qualities.len() as f64;
        let suggested = ((avg - 0.10).clamp(0.4, 0.9) * 100.0).round() / 100.0;
        suggestions.insert(
            "quality_threshold".into(),
            json!({
                "current_avg": avg,
                "suggested": suggested,
                "reasoning": format!(
                    "average quality is {avg:.2}; suggested threshold {suggested}"
                ),
            }),
        );
    }

    let mut tier_counts: BTreeMap<u8, u64> = BTreeMap::new();
    for d in decisions {
        *tier_counts.entry(d.chosen_tier).or_default() += 1;
    }
    let total: u64 = tier_counts.values().sum();
    if total > 0 {
        let distribution: BTreeMap<String, String> = tier_counts
            .iter()
            .map(|(tier, count)| {
                (
                    tier.to_string(),
                    format!("{count} ({:.1}%)", *count as f64 / total as f64 * 100.0),
                )
            })
            .collect();
        suggestions.insert("tier_distribution".into(), json!(distribution));
    }

    Value::Object(suggestions)
}

/// Full tuning report over a decision set.
pub fn analyze(decisions: &[RoutingDecisionRecord]) -> Value {
    json!({
        "total_decisions": decisions.len(),
        "over_escalation": over_escalations(decisions, 0.75),
        "under_escalation": under_escalations(decisions, 0.70),
        "cost_analysis": cost_analysis(decisions),
        "threshold_suggestions": suggest_thresholds(decisions),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(
        request_tier: u8,
        chosen_tier: u8,
        confidence: Option<f64>,
        quality: Option<f64>,
        provider: &str,
        cost: f64,
    ) -> RoutingDecisionRecord {
        RoutingDecisionRecord {
            decision_id: uuid::Uuid::new_v4().to_string(),
            run_id: "run-1".into(),
            node_id: "node".into(),
            agent_id: "agent".into(),
            request_tier,
            chosen_tier,
            provider: Some(provider.into()),
            escalation_reason: None,
            confidence,
            complexity: None,
            quality,
            latency_ms: 100.0,
            tokens_in: 100,
            tokens_out: 50,
            cost_usd: cost,
            created_at: "2026-08-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn over_escalation_flags_confident_upgrades() {
        let decisions = vec![
            decision(1, 2, Some(0.9), None, "local", 0.0),
            decision(1, 1, Some(0.9), None, "local", 0.0),
            decision(1, 3, Some(0.4), None, "cloud_a", 0.01),
        ];
        let issues = over_escalations(&decisions, 0.75);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0]["chosen_tier"], 2);
    }

    #[test]
    fn under_escalation_flags_poor_low_tier_output() {
        let decisions = vec![
            decision(2, 2, None, Some(0.4), "local", 0.0),
            decision(2, 3, None, Some(0.4), "cloud_a", 0.01),
            decision(2, 2, None, Some(0.9), "local", 0.0),
        ];
        let issues = under_escalations(&decisions, 0.70);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn cost_analysis_groups_by_provider() {
        let decisions = vec![
            decision(3, 3, None, None, "cloud_a", 0.02),
            decision(3, 3, None, None, "cloud_a", 0.04),
            decision(3, 3, None, None, "cloud_b", 0.01),
        ];
        let report = cost_analysis(&decisions);
        assert!(
            (report["total_cost_by_provider"]["cloud_a"].as_f64().unwrap() - 0.06).abs() < 1e-9
        );
        assert_eq!(report["call_count_by_provider"]["cloud_b"], 1);
    }

    #[test]
    fn threshold_suggestions_track_averages() {
        let decisions = vec![
            decision(1, 1, Some(0.9), Some(0.8), "local", 0.0),
            decision(1, 1, Some(0.7), Some(0.9), "local", 0.0),
        ];
        let suggestions = suggest_thresholds(&decisions);
        let conf = &suggestions["confidence_threshold"];
        assert!((conf["current_avg"].as_f64().unwrap() - 0.8).abs() < 1e-9);
        assert!((conf["suggested"].as_f64().unwrap() - 0.75).abs() < 1e-9);
        assert!(suggestions["tier_distribution"]["1"]
            .as_str()
            .unwrap()
            .contains("100.0%"));
    }

    #[test]
    fn analyze_handles_empty_input() {
        let report = analyze(&[]);
        assert_eq!(report["total_decisions"], 0);
        assert_eq!(report["over_escalation"].as_array().unwrap().len(), 0);
    }
}
