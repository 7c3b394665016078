use std::sync::Arc;

use serde::Serialize;
use sparkle_core::config::{LlmConfig, ModelSpec, RouterConfig};
use sparkle_core::{ChatMessage, Tier};
use thiserror::Error;
use tracing::warn;

use crate::batcher::RequestBatcher;
use crate::budget::{BudgetDecision, BudgetManager, BudgetStatus};
use crate::complexity::{Complexity, ComplexityAnalyzer, QueryContext};
use crate::router::{ModelRouter, RouterStats};

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
}

/// The optimizer's answer for one request: which model, which messages, and
/// whether the batcher should carry the call.
#[derive(Debug)]
pub struct OptimizationPlan {
    pub tier: Tier,
    pub model: ModelSpec,
    pub messages: Vec<ChatMessage>,
    pub trimmed: bool,
    pub estimated_cost_usd: f64,
    pub complexity: Complexity,
    pub use_batcher: bool,
    pub recommendations: Vec<String>,
}

/// Aggregated savings and posture for the optimization report endpoint.
#[derive(Debug, Serialize)]
pub struct OptimizationReport {
    pub routing: RouterStats,
    pub budget: BudgetStatus,
    pub batching: Option<crate::batcher::BatchStats>,
}

/// Orchestrates complexity analysis, routing, budget enforcement, and
/// batching into one plan per request.
pub struct CostOptimizer {
    analyzer: ComplexityAnalyzer,
    router: ModelRouter,
    budget: BudgetManager,
    batcher: Option<Arc<RequestBatcher>>,
}

impl CostOptimizer {
    pub fn new(
        router_config: &RouterConfig,
        llm_config: &LlmConfig,
        budget: BudgetManager,
        batcher: Option<Arc<RequestBatcher>>,
    ) -> Self {
        Self {
            analyzer: ComplexityAnalyzer::new(),
            router: ModelRouter::new(router_config, llm_config),
            budget,
            batcher,
        }
    }

    /// Produce a plan. Only hard budget caps fail; everything else degrades
    /// to a usable plan.
    pub fn optimize(
        &self,
        messages: Vec<ChatMessage>,
        user_message: &str,
        ctx: &QueryContext,
    ) -> Result<OptimizationPlan, OptimizeError> {
        let score = self.analyzer.analyze(user_message, ctx);
        let tier = self.router.route(score.level);
        let model = self.router.model_for(tier).clone();

        let mut recommendations = vec![format!(
            "complexity {} (score {}) routed to {} tier",
            score.level.as_str(),
            score.score,
            tier
        )];

        let (messages, trimmed, estimated_cost_usd) =
            match self.budget.check_request(&messages, &model) {
                BudgetDecision::Ok { estimated_cost_usd } => (messages, false, estimated_cost_usd),
                BudgetDecision::Trimmed {
                    messages,
                    estimated_cost_usd,
                    dropped,
                } => {
                    recommendations
                        .push(format!("history trimmed: dropped {dropped} oldest messages"));
                    (messages, true, estimated_cost_usd)
                }
                BudgetDecision::Rejected { reason } => {
                    warn!(%reason, "request rejected by budget manager");
                    return Err(OptimizeError::BudgetExceeded(reason));
                }
            };

        let status = self.budget.status();
        if status.alert {
            recommendations.push(format!(
                "budget alert: daily {:.0}%, monthly {:.0}% of cap",
                status.daily_fraction * 100.0,
                status.monthly_fraction * 100.0
            ));
        }

        Ok(OptimizationPlan {
            tier,
            model,
            messages,
            trimmed,
            estimated_cost_usd,
            complexity: score.level,
            use_batcher: self.batcher.is_some(),
            recommendations,
        })
    }

    /// Record the outcome of an executed plan so routing stats and budget
    /// counters stay current.
    pub fn record_outcome(&self, model_id: &str, ok: bool, latency_ms: u64, usd: f64, tokens: u64) {
        let tier = self.router.tier_of(model_id);
        self.router.record_outcome(tier, ok, latency_ms);
        if ok {
            self.budget.record_spend(usd, tokens);
        }
    }

    pub fn batcher(&self) -> Option<&Arc<RequestBatcher>> {
        self.batcher.as_ref()
    }

    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn report(&self) -> OptimizationReport {
        OptimizationReport {
            routing: self.router.stats(),
            budget: self.budget.status(),
            batching: self.batcher.as_ref().map(|b| b.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkle_core::config::BudgetConfig;

    fn optimizer() -> CostOptimizer {
        CostOptimizer::new(
            &RouterConfig::default(),
            &LlmConfig::default(),
            BudgetManager::new(BudgetConfig::default()),
            None,
        )
    }

    #[test]
    fn simple_query_plans_fast_tier() {
        let o = optimizer();
        let messages = vec![
            ChatMessage::system("You are a scheduling assistant."),
            ChatMessage::user("book a clean"),
        ];
        let plan = o
            .optimize(messages, "book a clean", &QueryContext::default())
            .unwrap();
        assert_eq!(plan.tier, Tier::Fast);
        assert!(!plan.trimmed);
        assert!(!plan.recommendations.is_empty());
    }

    #[test]
    fn oversize_history_is_trimmed_in_plan() {
        let o = optimizer();
        let mut messages = vec![ChatMessage::system("You are a scheduling assistant.")];
        for _ in 0..12 {
            messages.push(ChatMessage::user("x".repeat(1200)));
        }
        let plan = o
            .optimize(messages, "short question", &QueryContext::default())
            .unwrap();
        assert!(plan.trimmed);
        assert!(plan
            .recommendations
            .iter()
            .any(|r| r.contains("trimmed")));
    }

    #[test]
    fn exhausted_daily_budget_fails_the_plan() {
        let o = optimizer();
        o.budget().seed(10.0, 10.0);
        let messages = vec![ChatMessage::user("hi")];
        let err = o
            .optimize(messages, "hi", &QueryContext::default())
            .unwrap_err();
        assert!(matches!(err, OptimizeError::BudgetExceeded(_)));
    }

    #[test]
    fn outcome_recording_feeds_router_and_budget() {
        let o = optimizer();
        let model_id = LlmConfig::default().fast.id;
        o.record_outcome(&model_id, true, 150, 0.001, 120);
        let stats = o.router_stats();
        assert_eq!(stats.fast_requests, 1);
        assert!(o.budget().status().daily_spent_usd > 0.0);
    }
}
