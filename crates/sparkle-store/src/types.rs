use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
    Abandoned,
    Escalated,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Abandoned => "abandoned",
            ConversationStatus::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConversationStatus::Active)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "completed" => Ok(ConversationStatus::Completed),
            "abandoned" => Ok(ConversationStatus::Abandoned),
            "escalated" => Ok(ConversationStatus::Escalated),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub variant: String,
    pub prompt_version: i64,
    pub status: ConversationStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub total_messages: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub booking_completed: bool,
    pub escalated_to_human: bool,
    pub satisfaction: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub action: Option<String>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub response_time_ms: i64,
    pub created_at: String,
}

/// Fields for one message insert; the row id and timestamp are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub role: &'a str,
    pub content: &'a str,
    pub action: Option<&'a str>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub model: Option<&'a str>,
    pub temperature: Option<f64>,
    pub response_time_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheRow {
    pub message_hash: String,
    pub user_message: String,
    pub variant: String,
    pub response_message: String,
    pub response_action: String,
    pub response_data: Option<String>,
    pub model: Option<String>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
    pub expires_at: String,
    pub hit_count: i64,
    pub created_at: String,
    pub last_accessed: String,
}

#[derive(Debug, Clone)]
pub struct NewSafetyEvent<'a> {
    pub conversation_id: Option<&'a str>,
    pub check_type: &'a str,
    /// Redacted snippet only; callers must never pass raw user input here.
    pub user_message: &'a str,
    pub blocked: bool,
    pub violation_type: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct NewPiiEvent<'a> {
    pub conversation_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub source: &'a str,
    pub pii_detected: bool,
    /// CSV of detected kinds, e.g. "email,phone".
    pub pii_types: &'a str,
    pub risk_level: &'a str,
    pub risk_score: i64,
    pub redacted_count: i64,
    pub message_length: i64,
}

#[derive(Debug, Clone)]
pub struct NewShadowComparison<'a> {
    pub primary_variant: &'a str,
    pub shadow_variant: &'a str,
    pub primary_response: &'a str,
    pub shadow_response: &'a str,
    pub primary_duration: i64,
    pub shadow_duration: i64,
    pub primary_cost: f64,
    pub shadow_cost: f64,
    pub shadow_error: bool,
    pub different: bool,
    /// 1.0 = identical responses.
    pub difference_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShadowComparisonRow {
    pub id: i64,
    pub primary_variant: String,
    pub shadow_variant: String,
    pub primary_response: String,
    pub shadow_response: String,
    pub primary_duration: i64,
    pub shadow_duration: i64,
    pub primary_cost: f64,
    pub shadow_cost: f64,
    pub shadow_error: bool,
    pub different: bool,
    pub difference_score: f64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewCanaryEvent<'a> {
    pub canary_variant: &'a str,
    pub stable_variant: &'a str,
    pub stage: i64,
    pub event: &'a str,
    pub reason: Option<&'a str>,
    pub metrics_snapshot: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanaryEventRow {
    pub id: i64,
    pub canary_variant: String,
    pub stable_variant: String,
    pub stage: i64,
    pub event: String,
    pub reason: Option<String>,
    pub metrics_snapshot: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDriftDetection<'a> {
    pub variant: &'a str,
    pub drift_types: &'a str,
    pub severity: &'a str,
    pub baseline_window: &'a str,
    pub recent_window: &'a str,
    pub metrics: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftDetectionRow {
    pub id: i64,
    pub variant: String,
    pub drift_types: String,
    pub severity: String,
    pub baseline_window: String,
    pub recent_window: String,
    pub metrics: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrainingSessionRow {
    pub id: i64,
    pub session_id: String,
    pub variant: String,
    pub version: i64,
    pub status: String,
    pub training_data_size: i64,
    pub failure_analysis: Option<String>,
    pub new_variant: Option<String>,
    pub shadow_analysis: Option<String>,
    pub success: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelVersion {
    pub variant: String,
    pub version: i64,
    pub system_prompt: String,
    /// Free-form JSON metadata (welcome message, notes, temperature).
    pub metadata: serde_json::Value,
    /// Tag name -> description.
    pub tags: serde_json::Value,
    pub is_active: bool,
    pub created_at: String,
    pub activated_at: Option<String>,
}
