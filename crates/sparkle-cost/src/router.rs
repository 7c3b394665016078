use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sparkle_core::config::{LlmConfig, ModelSpec, RouterConfig, RoutingStrategy};
use sparkle_core::Tier;
use tracing::debug;

use crate::complexity::Complexity;

/// Rolling per-tier outcome counters feeding routing decisions.
#[derive(Debug, Default)]
struct TierCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl TierCounters {
    fn success_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            // Optimistic prior: an unused tier is assumed healthy so the
            // router will try it.
            return 1.0;
        }
        self.successes.load(Ordering::Relaxed) as f64 / requests as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / requests as f64
    }
}

/// Snapshot exposed by the routing-stats endpoint.
#[derive(Debug, Serialize)]
pub struct RouterStats {
    pub strategy: &'static str,
    pub fast_requests: u64,
    pub fast_success_rate: f64,
    pub fast_avg_latency_ms: f64,
    pub balanced_requests: u64,
    pub balanced_success_rate: f64,
    pub balanced_avg_latency_ms: f64,
}

/// Strategy seam: pick a tier from the complexity level and live tier stats.
pub trait RouteStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, complexity: Complexity, fast_success_rate: f64, avg_latency_ms: f64) -> Tier;
}

/// simple→fast; medium→fast while the fast tier stays healthy; complex→balanced.
struct CostOptimized {
    fast_success_floor: f64,
}

impl RouteStrategy for CostOptimized {
    fn name(&self) -> &'static str {
        "cost_optimized"
    }

    fn select(&self, complexity: Complexity, fast_success_rate: f64, _avg_latency_ms: f64) -> Tier {
        match complexity {
            Complexity::Simple => Tier::Fast,
            Complexity::Medium => {
                if fast_success_rate >= self.fast_success_floor {
                    Tier::Fast
                } else {
                    Tier::Balanced
                }
            }
            Complexity::Complex => Tier::Balanced,
        }
    }
}

/// simple→fast; everything else→balanced.
struct PerformanceOptimized;

impl RouteStrategy for PerformanceOptimized {
    fn name(&self) -> &'static str {
        "performance_optimized"
    }

    fn select(&self, complexity: Complexity, _fast: f64, _latency: f64) -> Tier {
        match complexity {
            Complexity::Simple => Tier::Fast,
            _ => Tier::Balanced,
        }
    }
}

/// simple→fast; medium→balanced only while latency is within the SLO;
/// complex→balanced.
struct BalancedStrategy {
    latency_slo_ms: f64,
}

impl RouteStrategy for BalancedStrategy {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn select(&self, complexity: Complexity, _fast: f64, avg_latency_ms: f64) -> Tier {
        match complexity {
            Complexity::Simple => Tier::Fast,
            Complexity::Medium => {
                if avg_latency_ms <= self.latency_slo_ms {
                    Tier::Balanced
                } else {
                    Tier::Fast
                }
            }
            Complexity::Complex => Tier::Balanced,
        }
    }
}

/// Complexity-based model router over the two configured tiers.
pub struct ModelRouter {
    strategy: Box<dyn RouteStrategy>,
    fast_spec: ModelSpec,
    balanced_spec: ModelSpec,
    fast: TierCounters,
    balanced: TierCounters,
}

impl ModelRouter {
    pub fn new(router_config: &RouterConfig, llm_config: &LlmConfig) -> Self {
        let strategy: Box<dyn RouteStrategy> = match router_config.strategy {
            RoutingStrategy::CostOptimized => Box::new(CostOptimized {
                fast_success_floor: router_config.fast_success_floor,
            }),
            RoutingStrategy::PerformanceOptimized => Box::new(PerformanceOptimized),
            RoutingStrategy::Balanced => Box::new(BalancedStrategy {
                latency_slo_ms: router_config.latency_slo_ms as f64,
            }),
        };
        Self {
            strategy,
            fast_spec: llm_config.fast.clone(),
            balanced_spec: llm_config.balanced.clone(),
            fast: TierCounters::default(),
            balanced: TierCounters::default(),
        }
    }

    pub fn route(&self, complexity: Complexity) -> Tier {
        let tier = self.strategy.select(
            complexity,
            self.fast.success_rate(),
            self.balanced.avg_latency_ms(),
        );
        debug!(complexity = complexity.as_str(), tier = %tier, "model routed");
        tier
    }

    pub fn model_for(&self, tier: Tier) -> &ModelSpec {
        match tier {
            Tier::Fast => &self.fast_spec,
            Tier::Balanced => &self.balanced_spec,
        }
    }

    /// Which tier a model id belongs to; balanced wins when the tiers are
    /// configured to the same id.
    pub fn tier_of(&self, model_id: &str) -> Tier {
        if model_id == self.balanced_spec.id {
            Tier::Balanced
        } else {
            Tier::Fast
        }
    }

    pub fn record_outcome(&self, tier: Tier, ok: bool, latency_ms: u64) {
        let counters = match tier {
            Tier::Fast => &self.fast,
            Tier::Balanced => &self.balanced,
        };
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            strategy: self.strategy.name(),
            fast_requests: self.fast.requests.load(Ordering::Relaxed),
            fast_success_rate: self.fast.success_rate(),
            fast_avg_latency_ms: self.fast.avg_latency_ms(),
            balanced_requests: self.balanced.requests.load(Ordering::Relaxed),
            balanced_success_rate: self.balanced.success_rate(),
            balanced_avg_latency_ms: self.balanced.avg_latency_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(strategy: RoutingStrategy) -> ModelRouter {
        let router_config = RouterConfig {
            strategy,
            ..RouterConfig::default()
        };
        ModelRouter::new(&router_config, &LlmConfig::default())
    }

    #[test]
    fn cost_optimized_keeps_medium_on_fast_while_healthy() {
        let r = router(RoutingStrategy::CostOptimized);
        assert_eq!(r.route(Complexity::Simple), Tier::Fast);
        assert_eq!(r.route(Complexity::Medium), Tier::Fast);
        assert_eq!(r.route(Complexity::Complex), Tier::Balanced);
    }

    #[test]
    fn cost_optimized_demotes_medium_when_fast_degrades() {
        let r = router(RoutingStrategy::CostOptimized);
        // 10 requests, 5 failures: 50% success < 90% floor.
        for i in 0..10 {
            r.record_outcome(Tier::Fast, i % 2 == 0, 100);
        }
        assert_eq!(r.route(Complexity::Medium), Tier::Balanced);
        // Simple stays on fast regardless.
        assert_eq!(r.route(Complexity::Simple), Tier::Fast);
    }

    #[test]
    fn performance_optimized_upgrades_medium() {
        let r = router(RoutingStrategy::PerformanceOptimized);
        assert_eq!(r.route(Complexity::Medium), Tier::Balanced);
    }

    #[test]
    fn balanced_respects_latency_slo() {
        let r = router(RoutingStrategy::Balanced);
        assert_eq!(r.route(Complexity::Medium), Tier::Balanced);
        // Blow the SLO on the balanced tier.
        for _ in 0..5 {
            r.record_outcome(Tier::Balanced, true, 10_000);
        }
        assert_eq!(r.route(Complexity::Medium), Tier::Fast);
    }

    #[test]
    fn stats_reflect_recorded_outcomes() {
        let r = router(RoutingStrategy::CostOptimized);
        r.record_outcome(Tier::Fast, true, 100);
        r.record_outcome(Tier::Fast, false, 300);
        let stats = r.stats();
        assert_eq!(stats.fast_requests, 2);
        assert!((stats.fast_success_rate - 0.5).abs() < 1e-9);
        assert!((stats.fast_avg_latency_ms - 200.0).abs() < 1e-9);
    }
}
