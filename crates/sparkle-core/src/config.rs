use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on user message length before any other safety check runs.
pub const MAX_MESSAGE_CHARS: usize = 5000;
/// Per-request pipeline deadline.
pub const DEFAULT_DEADLINE_SECS: u64 = 30;

/// Top-level config (sparkle.toml + SPARKLE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkleConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Default for SparkleConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            llm: LlmConfig::default(),
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            safety: SafetyConfig::default(),
            reliability: ReliabilityConfig::default(),
            router: RouterConfig::default(),
            batch: BatchConfig::default(),
            rollout: RolloutConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origin. `None` disables the CORS layer.
    #[serde(default)]
    pub cors_origin: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            cors_origin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Variant served to sessions that don't request one explicitly.
    #[serde(default = "default_variant")]
    pub default_variant: String,
    /// Active-session cap; new sessions beyond this are rejected with 503.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_variant: default_variant(),
            max_sessions: default_max_sessions(),
            temperature: default_temperature(),
        }
    }
}

/// Pricing and identity of one model tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    /// USD per 1M input tokens.
    pub input_cost_per_mtok: f64,
    /// USD per 1M output tokens.
    pub output_cost_per_mtok: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key. Falls back to the GROQ_API_KEY env var when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_fast_model")]
    pub fast: ModelSpec,
    #[serde(default = "default_balanced_model")]
    pub balanced: ModelSpec,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            chat_path: default_chat_path(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
            fast: default_fast_model(),
            balanced: default_balanced_model(),
        }
    }
}

impl LlmConfig {
    /// Resolve the API key: config value first, then GROQ_API_KEY env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("GROQ_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_per_request_usd")]
    pub per_request_usd: f64,
    #[serde(default = "default_per_request_input_tokens")]
    pub per_request_input_tokens: u32,
    #[serde(default = "default_per_request_output_tokens")]
    pub per_request_output_tokens: u32,
    #[serde(default = "default_per_request_total_tokens")]
    pub per_request_total_tokens: u32,
    #[serde(default = "default_daily_usd")]
    pub daily_usd: f64,
    #[serde(default = "default_monthly_usd")]
    pub monthly_usd: f64,
    /// Trim oldest non-system history instead of failing over-budget requests.
    #[serde(default = "bool_true")]
    pub auto_trim: bool,
    /// Fraction of any cap at which an alert is raised.
    #[serde(default = "default_alert_fraction")]
    pub alert_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_request_usd: default_per_request_usd(),
            per_request_input_tokens: default_per_request_input_tokens(),
            per_request_output_tokens: default_per_request_output_tokens(),
            per_request_total_tokens: default_per_request_total_tokens(),
            daily_usd: default_daily_usd(),
            monthly_usd: default_monthly_usd(),
            auto_trim: true,
            alert_fraction: default_alert_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_max_cache_entries")]
    pub max_entries: usize,
    /// Jaccard similarity acceptance threshold for approximate lookups.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// How many recent same-variant entries the similarity scan considers.
    #[serde(default = "default_similarity_scan_limit")]
    pub similarity_scan_limit: usize,
    /// Fraction of least-recently-accessed entries dropped on overflow.
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_max_cache_entries(),
            similarity_threshold: default_similarity_threshold(),
            similarity_scan_limit: default_similarity_scan_limit(),
            evict_fraction: default_evict_fraction(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionStrategy {
    /// Replace the whole value with a `[TYPE_REDACTED]` marker.
    Full,
    /// Keep last-4 digits / first character; only for echoing back to the
    /// same session.
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_redaction")]
    pub redaction: RedactionStrategy,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// PII score at which a message is blocked outright.
    #[serde(default = "default_pii_block_score")]
    pub pii_block_score: u32,
    /// Optional LLM-backed jailbreak detector. Off by default.
    #[serde(default)]
    pub semantic_detector: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redaction: default_redaction(),
            max_message_chars: default_max_message_chars(),
            pii_block_score: default_pii_block_score(),
            semantic_detector: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Named retry profile: "aggressive", "standard", or "conservative".
    #[serde(default = "default_retry_profile")]
    pub retry_profile: String,
    /// Shared retry budget per rolling window.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_retry_budget_window_secs")]
    pub retry_budget_window_secs: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retry_profile: default_retry_profile(),
            retry_budget: default_retry_budget(),
            retry_budget_window_secs: default_retry_budget_window_secs(),
            deadline_secs: default_deadline_secs(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Seconds the breaker stays OPEN before the first probe.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    /// Reopen backoff cap as a multiple of `open_secs`.
    #[serde(default = "default_max_backoff_factor")]
    pub max_backoff_factor: u32,
    /// Window error rate above which the threshold halves.
    #[serde(default = "default_adapt_high_error_rate")]
    pub adapt_high_error_rate: f64,
    /// Window error rate below which the threshold is raised by one.
    #[serde(default = "default_adapt_low_error_rate")]
    pub adapt_low_error_rate: f64,
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_size: default_window_size(),
            open_secs: default_open_secs(),
            max_backoff_factor: default_max_backoff_factor(),
            adapt_high_error_rate: default_adapt_high_error_rate(),
            adapt_low_error_rate: default_adapt_low_error_rate(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    CostOptimized,
    PerformanceOptimized,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_routing_strategy")]
    pub strategy: RoutingStrategy,
    /// Fast-tier success rate required before medium queries stay on fast.
    #[serde(default = "default_fast_success_floor")]
    pub fast_success_floor: f64,
    /// Average-latency SLO used by the balanced strategy.
    #[serde(default = "default_latency_slo_ms")]
    pub latency_slo_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: default_routing_strategy(),
            fast_success_floor: default_fast_success_floor(),
            latency_slo_ms: default_latency_slo_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: default_batch_window_ms(),
            max_size: default_batch_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            shadow: ShadowConfig::default(),
            canary: CanaryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Samples required before a promotion check is meaningful.
    #[serde(default = "default_shadow_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_shadow_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_shadow_max_difference_rate")]
    pub max_difference_rate: f64,
    #[serde(default = "default_shadow_max_latency_delta_ms")]
    pub max_latency_delta_ms: i64,
    #[serde(default = "default_shadow_max_cost_delta")]
    pub max_cost_delta: f64,
    /// Response-token Jaccard below which two answers count as different.
    #[serde(default = "default_shadow_similarity_floor")]
    pub similarity_floor: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            min_samples: default_shadow_min_samples(),
            max_error_rate: default_shadow_max_error_rate(),
            max_difference_rate: default_shadow_max_difference_rate(),
            max_latency_delta_ms: default_shadow_max_latency_delta_ms(),
            max_cost_delta: default_shadow_max_cost_delta(),
            similarity_floor: default_shadow_similarity_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "default_canary_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_canary_min_stage_secs")]
    pub min_stage_secs: u64,
    #[serde(default = "default_canary_max_error_rate")]
    pub max_error_rate: f64,
    /// p95 latency gate as a multiple of the stable baseline.
    #[serde(default = "default_canary_latency_factor")]
    pub latency_factor: f64,
    /// Booking-rate floor as a multiple of the stable baseline.
    #[serde(default = "default_canary_booking_factor")]
    pub booking_factor: f64,
    #[serde(default = "default_canary_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            min_samples: default_canary_min_samples(),
            min_stage_secs: default_canary_min_stage_secs(),
            max_error_rate: default_canary_max_error_rate(),
            latency_factor: default_canary_latency_factor(),
            booking_factor: default_canary_booking_factor(),
            health_interval_secs: default_canary_health_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub retraining: RetrainingConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drift: DriftConfig::default(),
            retraining: RetrainingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Booking-rate drop that counts as drift (absolute delta).
    #[serde(default = "default_booking_rate_threshold")]
    pub booking_rate_threshold: f64,
    #[serde(default = "default_escalation_rate_threshold")]
    pub escalation_rate_threshold: f64,
    /// Relative cost increase that counts as drift.
    #[serde(default = "default_cost_increase_threshold")]
    pub cost_increase_threshold: f64,
    #[serde(default = "default_response_time_threshold")]
    pub response_time_threshold: f64,
    /// Chi-squared critical value at df=4, p=0.05.
    #[serde(default = "default_chi_squared_critical")]
    pub chi_squared_critical: f64,
    #[serde(default = "default_min_samples_for_comparison")]
    pub min_samples_for_comparison: u64,
    #[serde(default = "default_baseline_days")]
    pub baseline_days: i64,
    #[serde(default = "default_recent_hours")]
    pub recent_hours: i64,
    #[serde(default = "default_drift_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_drift_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            booking_rate_threshold: default_booking_rate_threshold(),
            escalation_rate_threshold: default_escalation_rate_threshold(),
            cost_increase_threshold: default_cost_increase_threshold(),
            response_time_threshold: default_response_time_threshold(),
            chi_squared_critical: default_chi_squared_critical(),
            min_samples_for_comparison: default_min_samples_for_comparison(),
            baseline_days: default_baseline_days(),
            recent_hours: default_recent_hours(),
            check_interval_secs: default_drift_check_interval_secs(),
            cache_ttl_secs: default_drift_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingConfig {
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: i64,
    #[serde(default = "default_max_training_conversations")]
    pub max_training_conversations: usize,
    #[serde(default = "default_retraining_shadow_samples")]
    pub shadow_samples: usize,
    #[serde(default = "default_eval_pass_score")]
    pub eval_pass_score: f64,
}

impl Default for RetrainingConfig {
    fn default() -> Self {
        Self {
            cooldown_days: default_cooldown_days(),
            max_training_conversations: default_max_training_conversations(),
            shadow_samples: default_retraining_shadow_samples(),
            eval_pass_score: default_eval_pass_score(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sparkle/sparkle.db", home)
}
fn default_variant() -> String {
    "baseline".to_string()
}
fn default_max_sessions() -> usize {
    1000
}
fn default_temperature() -> f64 {
    0.7
}
fn default_llm_base_url() -> String {
    "https://api.groq.com/openai".to_string()
}
fn default_chat_path() -> String {
    "/v1/chat/completions".to_string()
}
fn default_request_timeout_secs() -> u64 {
    25
}
fn default_max_tokens() -> u32 {
    500
}
fn default_fast_model() -> ModelSpec {
    ModelSpec {
        id: "llama-3.1-8b-instant".to_string(),
        input_cost_per_mtok: 0.05,
        output_cost_per_mtok: 0.08,
    }
}
fn default_balanced_model() -> ModelSpec {
    ModelSpec {
        id: "llama-3.3-70b-versatile".to_string(),
        input_cost_per_mtok: 0.59,
        output_cost_per_mtok: 0.79,
    }
}
fn default_per_request_usd() -> f64 {
    0.01
}
fn default_per_request_input_tokens() -> u32 {
    2000
}
fn default_per_request_output_tokens() -> u32 {
    500
}
fn default_per_request_total_tokens() -> u32 {
    2500
}
fn default_daily_usd() -> f64 {
    10.0
}
fn default_monthly_usd() -> f64 {
    300.0
}
fn default_alert_fraction() -> f64 {
    0.8
}
fn default_cache_ttl_secs() -> i64 {
    3600
}
fn default_max_cache_entries() -> usize {
    1000
}
fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_similarity_scan_limit() -> usize {
    100
}
fn default_evict_fraction() -> f64 {
    0.10
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_redaction() -> RedactionStrategy {
    RedactionStrategy::Full
}
fn default_max_message_chars() -> usize {
    MAX_MESSAGE_CHARS
}
fn default_pii_block_score() -> u32 {
    20
}
fn default_retry_profile() -> String {
    "standard".to_string()
}
fn default_retry_budget() -> u32 {
    10
}
fn default_retry_budget_window_secs() -> u64 {
    60
}
fn default_deadline_secs() -> u64 {
    DEFAULT_DEADLINE_SECS
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_window_size() -> usize {
    100
}
fn default_open_secs() -> u64 {
    30
}
fn default_max_backoff_factor() -> u32 {
    8
}
fn default_adapt_high_error_rate() -> f64 {
    0.30
}
fn default_adapt_low_error_rate() -> f64 {
    0.05
}
fn default_health_probe_interval_secs() -> u64 {
    30
}
fn default_routing_strategy() -> RoutingStrategy {
    RoutingStrategy::CostOptimized
}
fn default_fast_success_floor() -> f64 {
    0.90
}
fn default_latency_slo_ms() -> u64 {
    2000
}
fn default_batch_window_ms() -> u64 {
    100
}
fn default_batch_max_size() -> usize {
    5
}
fn default_shadow_min_samples() -> usize {
    50
}
fn default_shadow_max_error_rate() -> f64 {
    0.05
}
fn default_shadow_max_difference_rate() -> f64 {
    0.30
}
fn default_shadow_max_latency_delta_ms() -> i64 {
    500
}
fn default_shadow_max_cost_delta() -> f64 {
    0.10
}
fn default_shadow_similarity_floor() -> f64 {
    0.8
}
fn default_canary_min_samples() -> u64 {
    100
}
fn default_canary_min_stage_secs() -> u64 {
    600
}
fn default_canary_max_error_rate() -> f64 {
    0.05
}
fn default_canary_latency_factor() -> f64 {
    1.3
}
fn default_canary_booking_factor() -> f64 {
    0.9
}
fn default_canary_health_interval_secs() -> u64 {
    60
}
fn default_booking_rate_threshold() -> f64 {
    0.10
}
fn default_escalation_rate_threshold() -> f64 {
    0.15
}
fn default_cost_increase_threshold() -> f64 {
    0.20
}
fn default_response_time_threshold() -> f64 {
    0.25
}
fn default_chi_squared_critical() -> f64 {
    9.488
}
fn default_min_samples_for_comparison() -> u64 {
    50
}
fn default_baseline_days() -> i64 {
    7
}
fn default_recent_hours() -> i64 {
    24
}
fn default_drift_check_interval_secs() -> u64 {
    3600
}
fn default_drift_cache_ttl_secs() -> i64 {
    300
}
fn default_cooldown_days() -> i64 {
    7
}
fn default_max_training_conversations() -> usize {
    500
}
fn default_retraining_shadow_samples() -> usize {
    100
}
fn default_eval_pass_score() -> f64 {
    0.8
}

impl SparkleConfig {
    /// Load config from a TOML file with SPARKLE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./sparkle.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("sparkle.toml");

        let config: SparkleConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPARKLE_").split("_"))
            .extract()
            .map_err(|e| crate::error::SparkleError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_numbers() {
        let c = SparkleConfig::default();
        assert_eq!(c.budget.per_request_usd, 0.01);
        assert_eq!(c.budget.per_request_total_tokens, 2500);
        assert_eq!(c.budget.daily_usd, 10.0);
        assert_eq!(c.budget.monthly_usd, 300.0);
        assert_eq!(c.cache.ttl_secs, 3600);
        assert_eq!(c.cache.max_entries, 1000);
        assert_eq!(c.cache.similarity_threshold, 0.85);
        assert_eq!(c.reliability.breaker.failure_threshold, 5);
        assert_eq!(c.reliability.retry_budget, 10);
        assert_eq!(c.lifecycle.drift.chi_squared_critical, 9.488);
        assert_eq!(c.lifecycle.drift.min_samples_for_comparison, 50);
        assert_eq!(c.rollout.canary.min_samples, 100);
        assert_eq!(c.agent.max_sessions, 1000);
    }

    #[test]
    fn redaction_strategy_parses_lowercase() {
        let s: RedactionStrategy = serde_json::from_str("\"partial\"").unwrap();
        assert_eq!(s, RedactionStrategy::Partial);
    }
}
