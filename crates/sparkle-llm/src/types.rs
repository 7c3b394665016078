use async_trait::async_trait;
use serde::Serialize;
use sparkle_core::{Action, ChatMessage};

use crate::error::LlmError;

/// Request to the chat-completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider for a strict JSON object response.
    pub json_response: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Parsed completion: user-facing text plus the structured intent the
/// assistant was instructed to emit.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub message: String,
    pub action: Action,
    pub extracted: serde_json::Value,
    pub usage: Usage,
    pub model: String,
}

/// Stateless chat-completion seam. All retry, circuit, and budget logic
/// lives above this interface.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionOutcome, LlmError>;
}
