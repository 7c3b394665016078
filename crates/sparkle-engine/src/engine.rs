use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sparkle_cache::{cache_key, CachePut, CachedResponse, ResponseCache};
use sparkle_core::config::SparkleConfig;
use sparkle_core::{Action, ChatMessage, Role};
use sparkle_cost::{CostOptimizer, OptimizeError, QueryContext};
use sparkle_llm::{ChatCompleter, CompletionOutcome, CompletionRequest};
use sparkle_reliability::{
    BreakerRegistry, ErrorClassifier, ErrorKind, OperationError, RecoveryOptions,
    RecoveryStrategies, ReliabilityMetrics, RetryPolicy, Strategy,
};
use sparkle_safety::{InputVerdict, Redactor, SafetyPipeline};
use sparkle_store::{ConversationStatus, NewMessage, Store};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::prompt::{self, DEFAULT_SYSTEM_PROMPT};
use crate::session::{SessionHandle, SessionRegistry, SessionState};

/// Name of the circuit breaker guarding the chat-completion service.
const LLM_BREAKER: &str = "llm";

const DEGRADED_MESSAGE: &str =
    "I'm having trouble on my end — let me connect you with a human who can help \
     you finish your booking.";

/// One completed LLM turn as the recovery layer sees it.
#[derive(Debug, Clone)]
pub struct LlmTurn {
    pub message: String,
    pub action: Action,
    pub extracted: serde_json::Value,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

impl LlmTurn {
    fn degraded() -> Self {
        Self {
            message: DEGRADED_MESSAGE.to_string(),
            action: Action::Escalate,
            extracted: serde_json::json!({}),
            input_tokens: 0,
            output_tokens: 0,
            model: "degraded".to_string(),
        }
    }

    fn from_completion(outcome: CompletionOutcome) -> Self {
        Self {
            message: outcome.message,
            action: outcome.action,
            extracted: outcome.extracted,
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
            model: outcome.model,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StartedConversation {
    pub session_id: String,
    pub conversation_id: String,
    pub variant: String,
    pub welcome_message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMetadata {
    pub model: Option<String>,
    pub tokens: i64,
    pub cost_usd: f64,
    pub response_time_ms: i64,
    pub from_cache: bool,
    /// Recovery strategy that produced the reply, when not PRIMARY.
    pub strategy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub action: Action,
    pub extracted_data: serde_json::Value,
    pub metadata: ChatMetadata,
}

/// A chat turn either produces a reply or a safety block. Blocks are normal
/// outcomes with their own HTTP shape, not errors.
#[derive(Debug)]
pub enum ChatOutcome {
    Reply(ChatResponse),
    Blocked {
        check_type: String,
        reason: String,
        message: String,
    },
}

/// Per-session conversation engine: composes safety, cache, cost, recovery,
/// the LLM adapter, and the store into one pipeline per user turn.
pub struct ConversationEngine {
    config: Arc<SparkleConfig>,
    store: Arc<Store>,
    llm: Arc<dyn ChatCompleter>,
    safety: Arc<SafetyPipeline>,
    cache: Arc<ResponseCache>,
    optimizer: Arc<CostOptimizer>,
    classifier: Arc<ErrorClassifier>,
    recovery: RecoveryStrategies<LlmTurn>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    redactor: Redactor,
    sessions: SessionRegistry,
}

impl ConversationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SparkleConfig>,
        store: Arc<Store>,
        llm: Arc<dyn ChatCompleter>,
        safety: Arc<SafetyPipeline>,
        cache: Arc<ResponseCache>,
        optimizer: Arc<CostOptimizer>,
        classifier: Arc<ErrorClassifier>,
        reliability_metrics: Arc<ReliabilityMetrics>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        let recovery = RecoveryStrategies::new(
            classifier.clone(),
            reliability_metrics,
            Duration::from_secs(config.cache.ttl_secs.max(0) as u64),
        );
        let max_sessions = config.agent.max_sessions;
        Self {
            config,
            store,
            llm,
            safety,
            cache,
            optimizer,
            classifier,
            recovery,
            breakers,
            retry,
            redactor: Redactor::new(),
            sessions: SessionRegistry::new(max_sessions),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Open a new session on `variant` (or the configured default) and
    /// return the variant's welcome message.
    #[instrument(skip(self))]
    pub fn start_conversation(
        &self,
        variant: Option<&str>,
    ) -> Result<StartedConversation, EngineError> {
        let variant = variant
            .unwrap_or(&self.config.agent.default_variant)
            .to_string();
        let version =
            self.store
                .get_active_version(&variant)?
                .ok_or_else(|| EngineError::NoActiveVersion {
                    variant: variant.clone(),
                })?;

        let session_id = Uuid::now_v7().to_string();
        let conversation_id =
            self.store
                .insert_conversation(&session_id, &variant, version.version)?;
        let handle = SessionHandle::new(conversation_id.clone(), variant.clone(), version.version);
        if let Err(e) = self.sessions.insert(&session_id, handle) {
            // Registry full: the row exists but the session never went live.
            self.store
                .set_conversation_status(&conversation_id, ConversationStatus::Abandoned)?;
            return Err(e);
        }

        info!(session_id, variant, "conversation started");
        Ok(StartedConversation {
            session_id,
            conversation_id,
            variant,
            welcome_message: prompt::welcome_message(&version.metadata),
        })
    }

    /// One user turn. See the pipeline contract in the crate docs: safety in,
    /// cache, optimize, recover-around-LLM, safety out, persist.
    #[instrument(skip(self, user_message))]
    pub async fn chat(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<ChatOutcome, EngineError> {
        let handle = self.resolve(session_id)?;
        let _turn = handle
            .turn_lock
            .try_lock()
            .map_err(|_| EngineError::SessionBusy {
                session_id: session_id.to_string(),
            })?;
        if handle.state().is_terminal() {
            return Err(EngineError::SessionClosed {
                session_id: session_id.to_string(),
            });
        }

        // Input safety. A block is a normal outcome; nothing is persisted to
        // the message log (blocked text may carry PII).
        let verdict =
            self.safety
                .check_input(session_id, Some(&handle.conversation_id), user_message);
        if let InputVerdict::Blocked {
            check_type,
            reason,
            user_reply,
        } = verdict
        {
            return Ok(ChatOutcome::Blocked {
                check_type: check_type.to_string(),
                reason,
                message: user_reply,
            });
        }

        let started = Instant::now();

        // Response cache.
        match self.cache.lookup(user_message, &handle.variant) {
            Ok(Some(cached)) => {
                return self.finish_cached_turn(&handle, session_id, user_message, cached, started);
            }
            Ok(None) => {}
            Err(e) => warn!(err = %e, "cache lookup failed, treating as miss"),
        }

        // Build the message list: persisted system prompt, full history, new
        // user turn.
        let system_prompt = self.system_prompt_for(&handle);
        let history = self.store.list_messages(&handle.conversation_id)?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&system_prompt));
        for m in &history {
            if let Ok(role) = m.role.parse::<Role>() {
                if role != Role::System {
                    messages.push(ChatMessage {
                        role,
                        content: m.content.clone(),
                    });
                }
            }
        }
        messages.push(ChatMessage::user(user_message));

        let previously_escalated = self
            .store
            .get_conversation(&handle.conversation_id)?
            .map(|c| c.escalated_to_human)
            .unwrap_or(false);
        let ctx = QueryContext {
            history_len: history.len(),
            reasoning_required: false,
            previously_escalated,
        };

        // Optimization plan: model tier, possibly trimmed history.
        let plan = match self.optimizer.optimize(messages, user_message, &ctx) {
            Ok(p) => p,
            Err(OptimizeError::BudgetExceeded(reason)) => {
                return Err(EngineError::BudgetExceeded(reason));
            }
        };

        // LLM call through the full recovery stack, bounded by the request
        // deadline.
        let request = CompletionRequest {
            model: plan.model.id.clone(),
            messages: plan.messages.clone(),
            temperature: self.config.agent.temperature,
            max_tokens: self.config.llm.max_tokens,
            json_response: true,
        };
        let llm = self.llm.clone();
        let batcher = self.optimizer.batcher().cloned();
        let op = move || {
            let request = request.clone();
            let llm = llm.clone();
            let batcher = batcher.clone();
            async move {
                let result = match batcher {
                    Some(b) => b.submit(request).await,
                    None => llm.complete(&request).await,
                };
                result
                    .map(LlmTurn::from_completion)
                    .map_err(OperationError::from)
            }
        };
        let opts = RecoveryOptions {
            cache_key: Some(cache_key(user_message, &handle.variant)),
            degraded: Some(Box::new(LlmTurn::degraded)),
            fallback: None,
        };

        let breaker = self.breakers.get_or_create(LLM_BREAKER);
        let deadline = Duration::from_secs(self.config.reliability.deadline_secs);
        let recovered = tokio::time::timeout(
            deadline,
            self.recovery.execute(&breaker, &self.retry, op, opts),
        )
        .await;

        let (turn, strategy_label) = match recovered {
            Ok(outcome) => {
                let label = strategy_label(outcome.strategy);
                match outcome.data {
                    Some(turn) => (turn, label),
                    None => {
                        // Every tier exhausted: answer with the classifier's
                        // user message and escalate.
                        let class = outcome.classification.unwrap_or_else(|| {
                            self.classifier.entry(ErrorKind::Unknown)
                        });
                        (
                            LlmTurn {
                                message: class.user_message,
                                action: Action::Escalate,
                                extracted: serde_json::json!({}),
                                input_tokens: 0,
                                output_tokens: 0,
                                model: "none".to_string(),
                            },
                            Some("FAILED".to_string()),
                        )
                    }
                }
            }
            Err(_elapsed) => {
                let class = self.classifier.entry(ErrorKind::NetworkTimeout);
                warn!(session_id, "chat deadline expired");
                (
                    LlmTurn {
                        message: class.user_message,
                        action: Action::Escalate,
                        extracted: serde_json::json!({}),
                        input_tokens: 0,
                        output_tokens: 0,
                        model: "none".to_string(),
                    },
                    Some("FAILED".to_string()),
                )
            }
        };
        let from_primary = strategy_label.is_none();

        // Output safety: leak + PII echo sanitization.
        let sanitized = self.safety.check_output(
            session_id,
            Some(&handle.conversation_id),
            &system_prompt,
            &turn.message,
        );
        let final_message = sanitized.message;

        let response_time_ms = started.elapsed().as_millis() as i64;
        let total_tokens = (turn.input_tokens + turn.output_tokens) as i64;
        let usd = (turn.input_tokens as f64 * plan.model.input_cost_per_mtok
            + turn.output_tokens as f64 * plan.model.output_cost_per_mtok)
            / 1_000_000.0;

        self.persist_turn(
            &handle,
            user_message,
            &final_message,
            turn.action,
            turn.input_tokens as i64,
            turn.output_tokens as i64,
            usd,
            Some(turn.model.as_str()),
            response_time_ms,
        )?;
        self.apply_action(&handle, turn.action)?;

        self.optimizer.record_outcome(
            &plan.model.id,
            from_primary,
            response_time_ms as u64,
            usd,
            total_tokens as u64,
        );

        // Cache only genuine, unleaked primary responses.
        if from_primary && !sanitized.leak_detected {
            let put = CachePut {
                user_message,
                variant: &handle.variant,
                response_message: &final_message,
                response_action: turn.action.as_str(),
                response_data: Some(&turn.extracted),
                model: Some(turn.model.as_str()),
                tokens: total_tokens,
                cost_usd: usd,
                response_time_ms,
            };
            if let Err(e) = self.cache.put(&put) {
                warn!(err = %e, "cache write failed");
            }
        }

        Ok(ChatOutcome::Reply(ChatResponse {
            message: final_message,
            action: turn.action,
            extracted_data: turn.extracted,
            metadata: ChatMetadata {
                model: Some(turn.model),
                tokens: total_tokens,
                cost_usd: usd,
                response_time_ms,
                from_cache: false,
                strategy: strategy_label,
            },
        }))
    }

    /// Record a completed booking. The appointment row itself belongs to an
    /// external collaborator; the engine marks the conversation and returns
    /// the new appointment id.
    #[instrument(skip(self, _details))]
    pub fn book(
        &self,
        session_id: &str,
        _details: &serde_json::Value,
    ) -> Result<String, EngineError> {
        let handle = self.resolve(session_id)?;
        if handle.state().is_terminal() && handle.state() != SessionState::Booked {
            return Err(EngineError::SessionClosed {
                session_id: session_id.to_string(),
            });
        }
        self.store.set_booking_completed(&handle.conversation_id)?;
        handle.set_state(SessionState::Booked);
        let appointment_id = Uuid::new_v4().to_string();
        info!(session_id, appointment_id, "booking completed");
        Ok(appointment_id)
    }

    /// Close a session. Escalated conversations keep their terminal status;
    /// everything else completes.
    #[instrument(skip(self))]
    pub fn end(&self, session_id: &str, satisfaction: Option<i64>) -> Result<(), EngineError> {
        let handle = self.resolve(session_id)?;
        if let Some(s) = satisfaction {
            self.store
                .set_satisfaction(&handle.conversation_id, s.clamp(1, 5))?;
        }
        let status = match handle.state() {
            SessionState::Escalated => ConversationStatus::Escalated,
            _ => ConversationStatus::Completed,
        };
        self.store
            .set_conversation_status(&handle.conversation_id, status)?;
        if !handle.state().is_terminal() {
            handle.set_state(SessionState::Abandoned);
        }
        self.sessions.remove(session_id);
        Ok(())
    }

    /// Ordered, PII-redacted history for a session. Works for closed
    /// sessions too.
    pub fn history(&self, session_id: &str) -> Result<Vec<(String, String)>, EngineError> {
        let conversation = self
            .store
            .get_conversation_by_session(session_id)?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let messages = self.store.list_messages(&conversation.id)?;
        Ok(messages
            .into_iter()
            .map(|m| {
                let (redacted, _) = self.redactor.redact_text(
                    &m.content,
                    sparkle_core::config::RedactionStrategy::Full,
                );
                (m.role, redacted)
            })
            .collect())
    }

    /// Run one turn against an arbitrary variant without touching any
    /// session state. Used by shadow execution and offline evaluation.
    pub async fn detached_turn(
        &self,
        variant: &str,
        history: Vec<ChatMessage>,
        user_message: &str,
    ) -> Result<LlmTurn, OperationError> {
        let version = self
            .store
            .get_active_version(variant)
            .map_err(|e| OperationError::Database(e.to_string()))?
            .ok_or_else(|| OperationError::Validation(format!("no active version for {variant}")))?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&version.system_prompt));
        messages.extend(history);
        messages.push(ChatMessage::user(user_message));

        let request = CompletionRequest {
            model: self.config.llm.fast.id.clone(),
            messages,
            temperature: self.config.agent.temperature,
            max_tokens: self.config.llm.max_tokens,
            json_response: true,
        };
        let outcome = self.llm.complete(&request).await?;
        Ok(LlmTurn::from_completion(outcome))
    }

    // --- private helpers ---------------------------------------------------

    /// Registry first; fall back to the store so sessions survive restarts.
    fn resolve(&self, session_id: &str) -> Result<Arc<SessionHandle>, EngineError> {
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(handle);
        }
        let conversation = self
            .store
            .get_conversation_by_session(session_id)?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let handle = SessionHandle::new(
            conversation.id.clone(),
            conversation.variant.clone(),
            conversation.prompt_version,
        );
        handle.set_state(state_from_row(&conversation));
        self.sessions.insert(session_id, handle.clone())?;
        Ok(handle)
    }

    fn system_prompt_for(&self, handle: &SessionHandle) -> String {
        match self.store.get_version(&handle.variant, handle.prompt_version) {
            Ok(Some(v)) => v.system_prompt,
            _ => DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    fn finish_cached_turn(
        &self,
        handle: &Arc<SessionHandle>,
        session_id: &str,
        user_message: &str,
        cached: CachedResponse,
        started: Instant,
    ) -> Result<ChatOutcome, EngineError> {
        let action = cached
            .action
            .parse::<Action>()
            .unwrap_or(Action::Continue);
        let system_prompt = self.system_prompt_for(handle);
        let sanitized = self.safety.check_output(
            session_id,
            Some(&handle.conversation_id),
            &system_prompt,
            &cached.message,
        );
        let response_time_ms = started.elapsed().as_millis() as i64;

        // Cache hits cost nothing; the rolling sums stay consistent with the
        // zero-token message rows.
        self.persist_turn(
            handle,
            user_message,
            &sanitized.message,
            action,
            0,
            0,
            0.0,
            cached.model.as_deref(),
            response_time_ms,
        )?;
        self.apply_action(handle, action)?;

        Ok(ChatOutcome::Reply(ChatResponse {
            message: sanitized.message,
            action,
            extracted_data: cached.data.unwrap_or_else(|| serde_json::json!({})),
            metadata: ChatMetadata {
                model: cached.model,
                tokens: 0,
                cost_usd: 0.0,
                response_time_ms,
                from_cache: true,
                strategy: None,
            },
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_turn(
        &self,
        handle: &SessionHandle,
        user_message: &str,
        assistant_message: &str,
        action: Action,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        model: Option<&str>,
        response_time_ms: i64,
    ) -> Result<(), EngineError> {
        self.store.insert_message(&NewMessage {
            conversation_id: &handle.conversation_id,
            role: "user",
            content: user_message,
            action: None,
            tokens: input_tokens,
            cost_usd: 0.0,
            model: None,
            temperature: None,
            response_time_ms: 0,
        })?;
        self.store.insert_message(&NewMessage {
            conversation_id: &handle.conversation_id,
            role: "assistant",
            content: assistant_message,
            action: Some(action.as_str()),
            tokens: output_tokens,
            cost_usd,
            model,
            temperature: Some(self.config.agent.temperature),
            response_time_ms,
        })?;
        self.store.update_conversation_rolling(
            &handle.conversation_id,
            2,
            input_tokens + output_tokens,
            cost_usd,
        )?;
        Ok(())
    }

    fn apply_action(&self, handle: &SessionHandle, action: Action) -> Result<(), EngineError> {
        handle.advance(action);
        match action {
            Action::BookAppointment => {
                self.store.set_booking_completed(&handle.conversation_id)?;
            }
            Action::Escalate => {
                self.store.set_escalated(&handle.conversation_id)?;
                self.store.set_conversation_status(
                    &handle.conversation_id,
                    ConversationStatus::Escalated,
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn strategy_label(strategy: Strategy) -> Option<String> {
    match strategy {
        Strategy::Primary => None,
        Strategy::Cached => Some("CACHED".to_string()),
        Strategy::Degraded => Some("DEGRADED".to_string()),
        Strategy::Fallback => Some("FALLBACK".to_string()),
    }
}

fn state_from_row(conversation: &sparkle_store::Conversation) -> SessionState {
    if conversation.escalated_to_human {
        SessionState::Escalated
    } else if conversation.booking_completed {
        SessionState::Booked
    } else if conversation.status.is_terminal() {
        SessionState::Abandoned
    } else {
        SessionState::AwaitingInfo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sparkle_cache::ResponseCache;
    use sparkle_core::config::SparkleConfig;
    use sparkle_cost::{BudgetManager, CostOptimizer};
    use sparkle_llm::{LlmError, Usage};
    use sparkle_reliability::{RetryBudget, RetryPolicyConfig};
    use sparkle_safety::SafetyMetrics;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted completer: returns canned structured replies, optionally
    /// failing every call.
    struct ScriptedLlm {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new() -> Self {
            Self {
                failing: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatCompleter for ScriptedLlm {
        async fn complete(
            &self,
            req: &CompletionRequest,
        ) -> Result<CompletionOutcome, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(LlmError::Api {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            let user = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("");
            let (action, extracted) = if user.contains("555-123-4567") {
                (
                    "check_availability",
                    serde_json::json!({
                        "name": "John Smith",
                        "phone": "5551234567",
                        "serviceType": "deep_cleaning",
                    }),
                )
            } else {
                ("collect_info", serde_json::json!({}))
            };
            Ok(CompletionOutcome {
                message: "Got it, what day works for you?".to_string(),
                action: action.parse().unwrap(),
                extracted,
                usage: Usage {
                    input_tokens: 100,
                    output_tokens: 40,
                },
                model: req.model.clone(),
            })
        }
    }

    fn engine_with(llm: Arc<ScriptedLlm>) -> ConversationEngine {
        let mut config = SparkleConfig::default();
        config.reliability.retry_profile = "standard".to_string();
        let config = Arc::new(config);
        let store = Arc::new(Store::open_in_memory().unwrap());
        prompt::seed_variant(&store, "baseline").unwrap();

        let classifier = Arc::new(ErrorClassifier::new());
        let reliability_metrics = Arc::new(ReliabilityMetrics::new());
        let safety = Arc::new(SafetyPipeline::new(
            config.safety.clone(),
            Arc::new(SafetyMetrics::new()),
            store.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.clone(), store.clone()));
        let optimizer = Arc::new(CostOptimizer::new(
            &config.router,
            &config.llm,
            BudgetManager::new(config.budget.clone()),
            None,
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.reliability.breaker.clone()));
        let retry = RetryPolicy::new(
            RetryPolicyConfig {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter_factor: 0.0,
            },
            RetryBudget::new(10, Duration::from_secs(60)),
            classifier.clone(),
        );
        ConversationEngine::new(
            config,
            store,
            llm,
            safety,
            cache,
            optimizer,
            classifier,
            reliability_metrics,
            breakers,
            retry,
        )
    }

    #[tokio::test]
    async fn happy_booking_flow() {
        let llm = Arc::new(ScriptedLlm::new());
        let engine = engine_with(llm.clone());

        let started = engine.start_conversation(Some("baseline")).unwrap();
        assert!(!started.welcome_message.is_empty());

        let outcome = engine
            .chat(&started.session_id, "I need a cleaning service for my home next Monday at 2pm")
            .await
            .unwrap();
        let reply = match outcome {
            ChatOutcome::Reply(r) => r,
            other => panic!("expected reply, got {other:?}"),
        };
        assert_eq!(reply.action, Action::CollectInfo);
        assert!(!reply.metadata.from_cache);
        assert!(reply.metadata.tokens > 0);

        let outcome = engine
            .chat(&started.session_id, "John Smith, 555-123-4567, 3-bedroom deep clean")
            .await
            .unwrap();
        let reply = match outcome {
            ChatOutcome::Reply(r) => r,
            other => panic!("expected reply, got {other:?}"),
        };
        assert_eq!(reply.action, Action::CheckAvailability);
        assert_eq!(reply.extracted_data["name"], "John Smith");

        let appointment = engine
            .book(&started.session_id, &serde_json::json!({"date": "Monday"}))
            .unwrap();
        assert!(!appointment.is_empty());

        engine.end(&started.session_id, Some(5)).unwrap();
        let conversation = engine
            .store
            .get_conversation_by_session(&started.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(conversation.status, ConversationStatus::Completed);
        assert!(conversation.booking_completed);
        assert_eq!(conversation.satisfaction, Some(5));

        // Rolling sums match the message rows.
        let messages = engine.store.list_messages(&conversation.id).unwrap();
        let sum_tokens: i64 = messages.iter().map(|m| m.tokens).sum();
        assert_eq!(sum_tokens, conversation.total_tokens);
    }

    #[tokio::test]
    async fn critical_pii_blocks_without_message_rows() {
        let engine = engine_with(Arc::new(ScriptedLlm::new()));
        let started = engine.start_conversation(None).unwrap();

        let outcome = engine
            .chat(
                &started.session_id,
                "My SSN is 123-45-6789 and card 4111-1111-1111-1111",
            )
            .await
            .unwrap();
        match outcome {
            ChatOutcome::Blocked { check_type, reason, .. } => {
                assert_eq!(check_type, "pii");
                assert_eq!(reason, "critical_pii_detected");
            }
            other => panic!("expected block, got {other:?}"),
        }
        let messages = engine.store.list_messages(&started.conversation_id).unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn llm_outage_degrades_to_escalation() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.failing.store(true, Ordering::SeqCst);
        let engine = engine_with(llm.clone());
        let started = engine.start_conversation(None).unwrap();

        let outcome = engine.chat(&started.session_id, "hello").await.unwrap();
        let reply = match outcome {
            ChatOutcome::Reply(r) => r,
            other => panic!("expected degraded reply, got {other:?}"),
        };
        assert_eq!(reply.action, Action::Escalate);
        assert_eq!(reply.metadata.strategy.as_deref(), Some("DEGRADED"));

        let conversation = engine
            .store
            .get_conversation(&started.conversation_id)
            .unwrap()
            .unwrap();
        assert!(conversation.escalated_to_human);
        assert_eq!(conversation.status, ConversationStatus::Escalated);
    }

    #[tokio::test]
    async fn terminal_sessions_reject_chat() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.failing.store(true, Ordering::SeqCst);
        let engine = engine_with(llm);
        let started = engine.start_conversation(None).unwrap();

        // Degraded turn escalates the session, a terminal state.
        let _ = engine.chat(&started.session_id, "hello").await.unwrap();
        let err = engine.chat(&started.session_id, "hi again").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn repeat_question_hits_the_cache() {
        let llm = Arc::new(ScriptedLlm::new());
        let engine = engine_with(llm.clone());

        let first = engine.start_conversation(None).unwrap();
        let _ = engine
            .chat(&first.session_id, "do you clean ovens")
            .await
            .unwrap();
        let calls_after_first = llm.calls.load(Ordering::SeqCst);

        let second = engine.start_conversation(None).unwrap();
        let outcome = engine
            .chat(&second.session_id, "Do you clean OVENS")
            .await
            .unwrap();
        let reply = match outcome {
            ChatOutcome::Reply(r) => r,
            other => panic!("expected reply, got {other:?}"),
        };
        assert!(reply.metadata.from_cache);
        assert_eq!(reply.metadata.cost_usd, 0.0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let engine = engine_with(Arc::new(ScriptedLlm::new()));
        let err = engine.chat("ghost", "hello").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound { .. }));
    }
}
