//! Provider registry: a named pool of model endpoints with cost/quality
//! metadata, strategy-based selection, availability flips, and daily call
//! caps that reset at local midnight.
//!
//! The registry is process-wide shared state; all mutation happens under one
//! mutex. Selection is deterministic: ties break by provider name.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use wintermute_agent::client::ModelClient;
use wintermute_core::config::ProviderConfig;

#[derive(Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub client: Arc<dyn ModelClient>,
    pub kind: String,
    pub model: String,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub quality_score: f64,
    pub max_context: u32,
    pub tags: Vec<String>,
    /// Per-provider daily cap; zero means only the aggregate cap applies.
    pub daily_cap: u32,
    pub available: bool,
    pub last_failure: Option<DateTime<Utc>>,
}

impl ProviderEntry {
    pub fn from_config(config: &ProviderConfig, client: Arc<dyn ModelClient>) -> Self {
        Self {
            name: config.name.clone(),
            client,
            kind: config.kind.clone(),
            model: config.model.clone(),
            cost_per_1k_input: config.cost_per_1k_input,
            cost_per_1k_output: config.cost_per_1k_output,
            quality_score: config.quality_score,
            max_context: config.max_context,
            tags: config.tags.clone(),
            daily_cap: config.daily_cap,
            available: true,
            last_failure: None,
        }
    }

    fn is_local(&self) -> bool {
        self.tags.iter().any(|t| t == "local" || t == "dgx")
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("quality_score", &self.quality_score)
            .field("available", &self.available)
            .finish()
    }
}

/// Filter criteria for provider selection.
#[derive(Debug, Clone)]
pub struct TaskRequirements {
    pub min_quality: f64,
    pub max_cost_per_1k: f64,
    pub min_context: u32,
    pub required_tags: Vec<String>,
}

impl Default for TaskRequirements {
    fn default() -> Self {
        Self {
            min_quality: 0.0,
            max_cost_per_1k: f64::INFINITY,
            min_context: 0,
            required_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    CheapestQualified,
    HighestQuality,
    PreferLocal,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cheapest_qualified" => Ok(Self::CheapestQualified),
            "highest_quality" => Ok(Self::HighestQuality),
            "prefer_local" => Ok(Self::PreferLocal),
            other => Err(format!("unknown selection strategy '{other}'")),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    providers: BTreeMap<String, ProviderEntry>,
    /// Aggregate daily cap across all providers; zero disables it.
    daily_cap: u32,
    /// date string → total calls
    daily_total: HashMap<String, u32>,
    /// date string → provider → calls
    daily_by_provider: HashMap<String, HashMap<String, u32>>,
}

pub struct ProviderRegistry {
    inner: Mutex<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new(daily_cap: u32) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                daily_cap,
                ..RegistryInner::default()
            }),
        }
    }

    fn today() -> String {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    }

    pub fn register(&self, entry: ProviderEntry) {
        let mut inner = self.inner.lock().expect("provider registry lock");
        tracing::info!(
            provider = %entry.name,
            kind = %entry.kind,
            quality = entry.quality_score,
            "registered provider"
        );
        inner.providers.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<ProviderEntry> {
        let inner = self.inner.lock().expect("provider registry lock");
        inner.providers.get(name).cloned()
    }

    pub fn list_available(&self) -> Vec<ProviderEntry> {
        let inner = self.inner.lock().expect("provider registry lock");
        inner
            .providers
            .values()
            .filter(|p| p.available)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("provider registry lock")
            .providers
            .is_empty()
    }

    fn filtered(inner: &RegistryInner, req: &TaskRequirements) -> Vec<ProviderEntry> {
        inner
            .providers
            .values()
            .filter(|p| {
                p.available
                    && p.quality_score >= req.min_quality
                    && p.max_context >= req.min_context
                    && p.cost_per_1k_output <= req.max_cost_per_1k
                    && req.required_tags.iter().all(|t| p.tags.contains(t))
            })
            .cloned()
            .collect()
    }

    fn ranked(mut candidates: Vec<ProviderEntry>, strategy: SelectionStrategy) -> Vec<ProviderEntry> {
        match strategy {
            SelectionStrategy::CheapestQualified => {
                candidates.sort_by(|a, b| {
                    a.cost_per_1k_output
                        .total_cmp(&b.cost_per_1k_output)
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
            SelectionStrategy::HighestQuality => {
                candidates.sort_by(|a, b| {
                    b.quality_score
                        .total_cmp(&a.quality_score)
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
            SelectionStrategy::PreferLocal => {
                candidates.sort_by(|a, b| {
                    b.is_local()
                        .cmp(&a.is_local())
                        .then_with(|| b.quality_score.total_cmp(&a.quality_score))
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
        }
        candidates
    }

    /// Best qualifying provider under the strategy, or `None` when nothing
    /// satisfies the requirements.
    pub fn select(
        &self,
        req: &TaskRequirements,
        strategy: SelectionStrategy,
    ) -> Option<ProviderEntry> {
        self.select_with_fallback(req, strategy, &[])
    }

    /// Same as [`select`](Self::select), excluding providers already tried.
    pub fn select_with_fallback(
        &self,
        req: &TaskRequirements,
        strategy: SelectionStrategy,
        exclude: &[String],
    ) -> Option<ProviderEntry> {
        let inner = self.inner.lock().expect("provider registry lock");
        let candidates = Self::filtered(&inner, req);
        Self::ranked(candidates, strategy)
            .into_iter()
            .find(|p| !exclude.contains(&p.name))
    }

    pub fn mark_unavailable(&self, name: &str) {
        let mut inner = self.inner.lock().expect("provider registry lock");
        if let Some(entry) = inner.providers.get_mut(name) {
            entry.available = false;
            entry.last_failure = Some(Utc::now());
            tracing::warn!(provider = %name, "provider marked unavailable");
        }
    }

    pub fn mark_available(&self, name: &str) {
        let mut inner = self.inner.lock().expect("provider registry lock");
        if let Some(entry) = inner.providers.get_mut(name) {
            entry.available = true;
        }
    }

    /// Record one tier-3 call against today's counters.
    pub fn record_call(&self, name: &str) {
        self.record_call_on(&Self::today(), name);
    }

    fn record_call_on(&self, day: &str, name: &str) {
        let mut inner = self.inner.lock().expect("provider registry lock");
        *inner.daily_total.entry(day.to_string()).or_default() += 1;
        *inner
            .daily_by_provider
            .entry(day.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default() += 1;
    }

    /// Whether the aggregate or this provider's own daily cap is spent.
    /// Counts are bucketed by local date, so the window resets at midnight.
    pub fn is_cap_exceeded(&self, name: &str) -> bool {
        self.is_cap_exceeded_on(&Self::today(), name)
    }

    fn is_cap_exceeded_on(&self, day: &str, name: &str) -> bool {
        let inner = self.inner.lock().expect("provider registry lock");
        let total = inner.daily_total.get(day).copied().unwrap_or(0);
        if inner.daily_cap > 0 && total >= inner.daily_cap {
            return true;
        }
        if let Some(entry) = inner.providers.get(name) {
            if entry.daily_cap > 0 {
                let used = inner
                    .daily_by_provider
                    .get(day)
                    .and_then(|m| m.get(name))
                    .copied()
                    .unwrap_or(0);
                if used >= entry.daily_cap {
                    return true;
                }
            }
        }
        false
    }

    pub fn calls_today(&self) -> u32 {
        let inner = self.inner.lock().expect("provider registry lock");
        inner
            .daily_total
            .get(&Self::today())
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wintermute_agent::client::MockModelClient;

    fn entry(name: &str, quality: f64, out_cost: f64, tags: &[&str]) -> ProviderEntry {
        ProviderEntry {
            name: name.into(),
            client: Arc::new(MockModelClient::from_texts(&[])),
            kind: "test".into(),
            model: format!("{name}-model"),
            cost_per_1k_input: out_cost / 3.0,
            cost_per_1k_output: out_cost,
            quality_score: quality,
            max_context: 32_000,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            daily_cap: 0,
            available: true,
            last_failure: None,
        }
    }

    fn registry_with_pool() -> ProviderRegistry {
        let registry = ProviderRegistry::new(100);
        registry.register(entry("dgx_large", 0.85, 0.0, &["local", "dgx"]));
        registry.register(entry("cloud_a", 0.95, 0.015, &["cloud", "frontier"]));
        registry.register(entry("cloud_b", 0.90, 0.010, &["cloud", "frontier"]));
        registry
    }

    #[test]
    fn prefer_local_picks_dgx_first() {
        let registry = registry_with_pool();
        let chosen = registry
            .select(&TaskRequirements::default(), SelectionStrategy::PreferLocal)
            .unwrap();
        assert_eq!(chosen.name, "dgx_large");
    }

    #[test]
    fn fallback_walks_quality_order_after_outage() {
        // Scenario: dgx down, prefer_local → cloud_a; cloud_a down → cloud_b.
        let registry = registry_with_pool();
        registry.mark_unavailable("dgx_large");

        let first = registry
            .select(&TaskRequirements::default(), SelectionStrategy::PreferLocal)
            .unwrap();
        assert_eq!(first.name, "cloud_a");

        registry.mark_unavailable("cloud_a");
        let second = registry
            .select(&TaskRequirements::default(), SelectionStrategy::PreferLocal)
            .unwrap();
        assert_eq!(second.name, "cloud_b");

        registry.mark_available("cloud_a");
        let recovered = registry
            .select(&TaskRequirements::default(), SelectionStrategy::PreferLocal)
            .unwrap();
        assert_eq!(recovered.name, "cloud_a");
    }

    #[test]
    fn cheapest_qualified_orders_by_output_cost() {
        let registry = registry_with_pool();
        let req = TaskRequirements {
            min_quality: 0.88,
            ..TaskRequirements::default()
        };
        let chosen = registry
            .select(&req, SelectionStrategy::CheapestQualified)
            .unwrap();
        assert_eq!(chosen.name, "cloud_b");
    }

    #[test]
    fn requirements_filter_out_unqualified() {
        let registry = registry_with_pool();
        let req = TaskRequirements {
            min_context: 100_000,
            ..TaskRequirements::default()
        };
        assert!(registry
            .select(&req, SelectionStrategy::HighestQuality)
            .is_none());
    }

    #[test]
    fn exclusion_skips_tried_providers() {
        let registry = registry_with_pool();
        let chosen = registry
            .select_with_fallback(
                &TaskRequirements::default(),
                SelectionStrategy::HighestQuality,
                &["cloud_a".to_string()],
            )
            .unwrap();
        assert_eq!(chosen.name, "cloud_b");
    }

    #[test]
    fn ties_break_by_name() {
        let registry = ProviderRegistry::new(0);
        registry.register(entry("beta", 0.9, 0.01, &["cloud"]));
        registry.register(entry("alpha", 0.9, 0.01, &["cloud"]));
        let chosen = registry
            .select(&TaskRequirements::default(), SelectionStrategy::HighestQuality)
            .unwrap();
        assert_eq!(chosen.name, "alpha");
    }

    #[test]
    fn aggregate_cap_blocks_every_provider() {
        let registry = ProviderRegistry::new(2);
        registry.register(entry("cloud_a", 0.95, 0.015, &["cloud"]));
        registry.register(entry("cloud_b", 0.90, 0.010, &["cloud"]));

        registry.record_call_on("2026-08-01", "cloud_a");
        registry.record_call_on("2026-08-01", "cloud_b");
        assert!(registry.is_cap_exceeded_on("2026-08-01", "cloud_a"));
        assert!(registry.is_cap_exceeded_on("2026-08-01", "cloud_b"));
    }

    #[test]
    fn per_provider_cap_is_independent() {
        let registry = ProviderRegistry::new(100);
        let mut capped = entry("cloud_a", 0.95, 0.015, &["cloud"]);
        capped.daily_cap = 1;
        registry.register(capped);
        registry.register(entry("cloud_b", 0.90, 0.010, &["cloud"]));

        registry.record_call_on("2026-08-01", "cloud_a");
        assert!(registry.is_cap_exceeded_on("2026-08-01", "cloud_a"));
        assert!(!registry.is_cap_exceeded_on("2026-08-01", "cloud_b"));
    }

    #[test]
    fn cap_window_resets_with_the_date() {
        let registry = ProviderRegistry::new(1);
        registry.register(entry("cloud_a", 0.95, 0.015, &["cloud"]));
        registry.record_call_on("2026-08-01", "cloud_a");
        assert!(registry.is_cap_exceeded_on("2026-08-01", "cloud_a"));
        assert!(!registry.is_cap_exceeded_on("2026-08-02", "cloud_a"));
    }
}
