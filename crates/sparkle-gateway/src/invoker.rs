use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sparkle_engine::ConversationEngine;
use sparkle_rollout::{ShadowInvoker, ShadowReply};

/// Bridges the rollout/lifecycle seams onto the conversation engine: one
/// detached turn against a variant, no session state touched.
pub struct EngineInvoker {
    engine: Arc<ConversationEngine>,
    /// Pricing for cost attribution of detached turns.
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
}

impl EngineInvoker {
    pub fn new(engine: Arc<ConversationEngine>, config: &sparkle_core::config::LlmConfig) -> Self {
        Self {
            engine,
            input_cost_per_mtok: config.fast.input_cost_per_mtok,
            output_cost_per_mtok: config.fast.output_cost_per_mtok,
        }
    }
}

#[async_trait]
impl ShadowInvoker for EngineInvoker {
    async fn invoke(&self, variant: &str, user_message: &str) -> Result<ShadowReply, String> {
        let started = Instant::now();
        let turn = self
            .engine
            .detached_turn(variant, Vec::new(), user_message)
            .await
            .map_err(|e| e.to_string())?;
        let cost_usd = (turn.input_tokens as f64 * self.input_cost_per_mtok
            + turn.output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0;
        Ok(ShadowReply {
            message: turn.message,
            action: turn.action.as_str().to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
            cost_usd,
        })
    }
}
