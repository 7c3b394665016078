use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sparkle_core::config::LlmConfig;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::parse::parse_structured;
use crate::types::{ChatCompleter, CompletionOutcome, CompletionRequest, Usage};

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_path: String,
}

impl LlmClient {
    /// Build a client from config. Fails when no API key can be resolved;
    /// the binary treats that as fatal at startup.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.resolve_api_key().ok_or(LlmError::MissingCredential)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.clone(),
            chat_path: config.chat_path.clone(),
        })
    }
}

#[async_trait]
impl ChatCompleter for LlmClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionOutcome, LlmError> {
        let body = build_request_body(req);
        let url = format!("{}{}", self.base_url, self.chat_path);

        debug!(model = %req.model, "sending chat completion request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(LlmError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "chat completion API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        Ok(into_outcome(api_resp))
    }
}

fn build_request_body(req: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
    });
    if req.json_response {
        body["response_format"] = serde_json::json!({ "type": "json_object" });
    }
    body
}

fn into_outcome(resp: ApiResponse) -> CompletionOutcome {
    let content = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    let reply = parse_structured(&content);

    CompletionOutcome {
        message: reply.message,
        action: reply.action,
        extracted: reply.extracted,
        usage: Usage {
            input_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: resp
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        },
        model: resp.model,
    }
}

// Wire types for the OpenAI-compatible response shape.

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkle_core::Action;

    #[test]
    fn response_parses_into_outcome() {
        let resp = ApiResponse {
            model: "llama-3.1-8b-instant".to_string(),
            choices: vec![Choice {
                message: ApiMessage {
                    content: Some(
                        r#"{"message": "When suits you?", "action": "collect_info", "extracted_data": {}}"#
                            .to_string(),
                    ),
                },
            }],
            usage: Some(ApiUsage {
                prompt_tokens: 120,
                completion_tokens: 30,
            }),
        };
        let outcome = into_outcome(resp);
        assert_eq!(outcome.action, Action::CollectInfo);
        assert_eq!(outcome.usage.total(), 150);
        assert_eq!(outcome.model, "llama-3.1-8b-instant");
    }

    #[test]
    fn request_body_carries_response_format() {
        let req = CompletionRequest {
            model: "m".to_string(),
            messages: vec![sparkle_core::ChatMessage::user("hi")],
            temperature: 0.7,
            max_tokens: 500,
            json_response: true,
        };
        let body = build_request_body(&req);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
