use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sparkle_core::config::ShadowConfig;
use sparkle_store::{NewShadowComparison, Store};
use tracing::{debug, warn};

/// How many recent comparisons feed the analysis.
const ANALYSIS_WINDOW: usize = 500;

/// One variant execution as the shadow runner sees it.
#[derive(Debug, Clone)]
pub struct ShadowReply {
    pub message: String,
    pub action: String,
    pub duration_ms: i64,
    pub cost_usd: f64,
}

/// Executes one detached turn against a variant. Implemented by the gateway
/// on top of the conversation engine; the indirection keeps this crate free
/// of an engine dependency.
#[async_trait]
pub trait ShadowInvoker: Send + Sync {
    async fn invoke(&self, variant: &str, user_message: &str) -> Result<ShadowReply, String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ShadowSetup {
    pub primary_variant: String,
    pub shadow_variant: String,
    pub traffic_percent: f64,
    pub started_at: String,
}

#[derive(Debug, Serialize)]
pub struct ShadowAnalysis {
    pub samples: usize,
    pub shadow_error_rate: f64,
    pub difference_rate: f64,
    pub avg_latency_delta_ms: f64,
    pub cost_delta_fraction: f64,
}

#[derive(Debug, Serialize)]
pub struct PromotionCheck {
    pub should_promote: bool,
    pub reasons: Vec<String>,
    pub analysis: ShadowAnalysis,
}

/// Runs a candidate variant against a fraction of real traffic without ever
/// affecting the user-facing response.
pub struct ShadowRunner {
    config: ShadowConfig,
    store: Arc<Store>,
    invoker: Arc<dyn ShadowInvoker>,
    active: Mutex<Option<ShadowSetup>>,
}

impl ShadowRunner {
    pub fn new(config: ShadowConfig, store: Arc<Store>, invoker: Arc<dyn ShadowInvoker>) -> Self {
        Self {
            config,
            store,
            invoker,
            active: Mutex::new(None),
        }
    }

    pub fn start(&self, primary: &str, shadow: &str, traffic_percent: f64) {
        let setup = ShadowSetup {
            primary_variant: primary.to_string(),
            shadow_variant: shadow.to_string(),
            traffic_percent: traffic_percent.clamp(0.0, 100.0),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        *self.active.lock().unwrap() = Some(setup);
    }

    pub fn stop(&self) {
        *self.active.lock().unwrap() = None;
    }

    pub fn status(&self) -> Option<ShadowSetup> {
        self.active.lock().unwrap().clone()
    }

    /// Fire-and-forget shadow execution for one user turn. Samples by the
    /// configured traffic percentage; the spawned task never blocks or fails
    /// the caller.
    pub fn maybe_shadow(
        self: &Arc<Self>,
        primary_variant: &str,
        user_message: &str,
        primary_reply: &ShadowReply,
    ) {
        let setup = {
            let active = self.active.lock().unwrap();
            match active.as_ref() {
                Some(s) if s.primary_variant == primary_variant => s.clone(),
                _ => return,
            }
        };
        if fastrand::f64() * 100.0 >= setup.traffic_percent {
            return;
        }

        let runner = self.clone();
        let user_message = user_message.to_string();
        let primary_reply = primary_reply.clone();
        tokio::spawn(async move {
            runner
                .run_shadow(&setup, &user_message, &primary_reply)
                .await;
        });
    }

    async fn run_shadow(&self, setup: &ShadowSetup, user_message: &str, primary: &ShadowReply) {
        let started = std::time::Instant::now();
        let result = self
            .invoker
            .invoke(&setup.shadow_variant, user_message)
            .await;
        let shadow_duration = started.elapsed().as_millis() as i64;

        let (shadow_reply, shadow_error) = match result {
            Ok(reply) => (reply, false),
            Err(e) => {
                // Shadow failures are logged and recorded, never surfaced.
                warn!(err = %e, shadow = %setup.shadow_variant, "shadow execution failed");
                (
                    ShadowReply {
                        message: String::new(),
                        action: String::new(),
                        duration_ms: shadow_duration,
                        cost_usd: 0.0,
                    },
                    true,
                )
            }
        };

        let similarity = token_jaccard(&primary.message, &shadow_reply.message);
        let different = shadow_error
            || primary.action != shadow_reply.action
            || similarity < self.config.similarity_floor;

        let row = NewShadowComparison {
            primary_variant: &setup.primary_variant,
            shadow_variant: &setup.shadow_variant,
            primary_response: &primary.message,
            shadow_response: &shadow_reply.message,
            primary_duration: primary.duration_ms,
            shadow_duration: shadow_reply.duration_ms,
            primary_cost: primary.cost_usd,
            shadow_cost: shadow_reply.cost_usd,
            shadow_error,
            different,
            difference_score: similarity,
        };
        if let Err(e) = self.store.insert_shadow_comparison(&row) {
            warn!(err = %e, "failed to persist shadow comparison");
        } else {
            debug!(similarity, different, "shadow comparison recorded");
        }
    }

    pub fn analysis(&self) -> Result<Option<ShadowAnalysis>, sparkle_store::StoreError> {
        let Some(setup) = self.status() else {
            return Ok(None);
        };
        let rows = self.store.shadow_comparisons(
            &setup.primary_variant,
            &setup.shadow_variant,
            ANALYSIS_WINDOW,
        )?;
        Ok(Some(analyze(&rows)))
    }

    /// Promotion gate: enough samples, low error rate, answers mostly agree,
    /// latency and cost within bounds.
    pub fn promotion_check(&self) -> Result<Option<PromotionCheck>, sparkle_store::StoreError> {
        let Some(analysis) = self.analysis()? else {
            return Ok(None);
        };
        let mut reasons = Vec::new();

        if analysis.samples < self.config.min_samples {
            reasons.push(format!(
                "insufficient samples: {} < {}",
                analysis.samples, self.config.min_samples
            ));
        }
        if analysis.shadow_error_rate > self.config.max_error_rate {
            reasons.push(format!(
                "shadow error rate {:.1}% above {:.1}%",
                analysis.shadow_error_rate * 100.0,
                self.config.max_error_rate * 100.0
            ));
        }
        if analysis.difference_rate > self.config.max_difference_rate {
            reasons.push(format!(
                "response difference rate {:.1}% above {:.1}%",
                analysis.difference_rate * 100.0,
                self.config.max_difference_rate * 100.0
            ));
        }
        if analysis.avg_latency_delta_ms > self.config.max_latency_delta_ms as f64 {
            reasons.push(format!(
                "latency delta {:.0}ms above {}ms",
                analysis.avg_latency_delta_ms, self.config.max_latency_delta_ms
            ));
        }
        if analysis.cost_delta_fraction > self.config.max_cost_delta {
            reasons.push(format!(
                "cost delta {:.1}% above {:.1}%",
                analysis.cost_delta_fraction * 100.0,
                self.config.max_cost_delta * 100.0
            ));
        }

        Ok(Some(PromotionCheck {
            should_promote: reasons.is_empty(),
            reasons,
            analysis,
        }))
    }
}

fn analyze(rows: &[sparkle_store::ShadowComparisonRow]) -> ShadowAnalysis {
    let samples = rows.len();
    if samples == 0 {
        return ShadowAnalysis {
            samples: 0,
            shadow_error_rate: 0.0,
            difference_rate: 0.0,
            avg_latency_delta_ms: 0.0,
            cost_delta_fraction: 0.0,
        };
    }
    let n = samples as f64;
    let errors = rows.iter().filter(|r| r.shadow_error).count() as f64;
    let different = rows.iter().filter(|r| r.different).count() as f64;
    let latency_delta: f64 = rows
        .iter()
        .map(|r| (r.shadow_duration - r.primary_duration) as f64)
        .sum::<f64>()
        / n;
    let primary_cost: f64 = rows.iter().map(|r| r.primary_cost).sum();
    let shadow_cost: f64 = rows.iter().map(|r| r.shadow_cost).sum();
    let cost_delta = if primary_cost > 0.0 {
        (shadow_cost - primary_cost) / primary_cost
    } else {
        0.0
    };
    ShadowAnalysis {
        samples,
        shadow_error_rate: errors / n,
        difference_rate: different / n,
        avg_latency_delta_ms: latency_delta,
        cost_delta_fraction: cost_delta,
    }
}

/// Jaccard similarity over lowercase word sets. 1.0 means identical.
fn token_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInvoker {
        action: &'static str,
        message: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl ShadowInvoker for FixedInvoker {
        async fn invoke(&self, _variant: &str, _user_message: &str) -> Result<ShadowReply, String> {
            if self.fail {
                return Err("shadow down".to_string());
            }
            Ok(ShadowReply {
                message: self.message.to_string(),
                action: self.action.to_string(),
                duration_ms: 120,
                cost_usd: 0.0002,
            })
        }
    }

    fn reply(message: &str, action: &str) -> ShadowReply {
        ShadowReply {
            message: message.to_string(),
            action: action.to_string(),
            duration_ms: 100,
            cost_usd: 0.0002,
        }
    }

    fn runner(invoker: FixedInvoker) -> Arc<ShadowRunner> {
        Arc::new(ShadowRunner::new(
            ShadowConfig::default(),
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(invoker),
        ))
    }

    #[tokio::test]
    async fn identical_replies_compare_as_same() {
        let r = runner(FixedInvoker {
            action: "collect_info",
            message: "what day works for you",
            fail: false,
        });
        r.start("baseline", "candidate", 100.0);
        let setup = r.status().unwrap();
        r.run_shadow(&setup, "book a clean", &reply("what day works for you", "collect_info"))
            .await;
        let analysis = r.analysis().unwrap().unwrap();
        assert_eq!(analysis.samples, 1);
        assert_eq!(analysis.difference_rate, 0.0);
    }

    #[tokio::test]
    async fn action_mismatch_is_different() {
        let r = runner(FixedInvoker {
            action: "escalate",
            message: "what day works for you",
            fail: false,
        });
        r.start("baseline", "candidate", 100.0);
        let setup = r.status().unwrap();
        r.run_shadow(&setup, "book a clean", &reply("what day works for you", "collect_info"))
            .await;
        let analysis = r.analysis().unwrap().unwrap();
        assert_eq!(analysis.difference_rate, 1.0);
    }

    #[tokio::test]
    async fn shadow_failure_is_swallowed_and_recorded() {
        let r = runner(FixedInvoker {
            action: "",
            message: "",
            fail: true,
        });
        r.start("baseline", "candidate", 100.0);
        let setup = r.status().unwrap();
        r.run_shadow(&setup, "book a clean", &reply("hello there", "collect_info"))
            .await;
        let analysis = r.analysis().unwrap().unwrap();
        assert_eq!(analysis.shadow_error_rate, 1.0);
    }

    #[tokio::test]
    async fn promotion_requires_minimum_samples() {
        let r = runner(FixedInvoker {
            action: "collect_info",
            message: "what day works for you",
            fail: false,
        });
        r.start("baseline", "candidate", 100.0);
        let setup = r.status().unwrap();
        for _ in 0..10 {
            r.run_shadow(&setup, "book a clean", &reply("what day works for you", "collect_info"))
                .await;
        }
        let check = r.promotion_check().unwrap().unwrap();
        assert!(!check.should_promote);
        assert!(check.reasons.iter().any(|r| r.contains("insufficient samples")));
    }

    #[tokio::test]
    async fn healthy_shadow_promotes_after_enough_samples() {
        let r = runner(FixedInvoker {
            action: "collect_info",
            message: "what day works for you",
            fail: false,
        });
        r.start("baseline", "candidate", 100.0);
        let setup = r.status().unwrap();
        for _ in 0..50 {
            r.run_shadow(&setup, "book a clean", &reply("what day works for you", "collect_info"))
                .await;
        }
        let check = r.promotion_check().unwrap().unwrap();
        assert!(check.should_promote, "reasons: {:?}", check.reasons);
    }

    #[test]
    fn jaccard_boundaries() {
        assert_eq!(token_jaccard("a b c", "a b c"), 1.0);
        assert!(token_jaccard("a b c d e", "a b c d x") < 1.0);
        assert_eq!(token_jaccard("", ""), 1.0);
    }
}
