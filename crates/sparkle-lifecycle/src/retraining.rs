use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sparkle_core::config::RetrainingConfig;
use sparkle_rollout::{ShadowInvoker, ShadowRunner};
use sparkle_store::Store;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::drift::{DriftAnalysis, DriftSeverity};
use crate::LifecycleError;

/// Failure categories the analysis buckets conversations into.
const CATEGORIES: [(&str, &[&str]); 4] = [
    ("pricing", &["price", "cost", "quote", "expensive", "charge"]),
    ("availability", &["available", "availability", "slot", "schedule", "reschedule"]),
    ("clarity", &["confus", "understand", "repeat", "what do you mean", "unclear"]),
    ("technical", &["error", "trouble", "problem", "broken", "not working"]),
];

/// Offline evaluation cases: booking-domain inputs with the action a healthy
/// prompt should produce.
const EVAL_CASES: [(&str, &str); 10] = [
    ("I need a cleaning service for my home next Monday at 2pm", "collect_info"),
    ("John Smith, 555-123-4567, 3-bedroom deep clean", "check_availability"),
    ("What services do you offer?", "collect_info"),
    ("Can you do a move-out clean this weekend?", "collect_info"),
    ("Yes, book that slot for me", "book_appointment"),
    ("I want to talk to a real person", "escalate"),
    ("How much is a deep clean for a 2-bedroom?", "collect_info"),
    ("Tuesday morning works", "confirm"),
    ("Actually can we do Thursday instead?", "check_availability"),
    ("My house has 4 bedrooms and 3 baths", "collect_info"),
];

#[derive(Debug, Clone, Serialize)]
pub struct FailureAnalysis {
    pub conversations_scanned: usize,
    pub failures: usize,
    pub categories: HashMap<String, usize>,
    pub top_categories: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ShouldRetrain {
    pub should_retrain: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RetrainingStartReport {
    pub session_id: String,
    pub variant: String,
    pub candidate_variant: String,
    pub next_version: i64,
    pub training_data_size: usize,
    pub failure_analysis: FailureAnalysis,
    pub eval_score: f64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct RetrainingFinalizeReport {
    pub session_id: String,
    pub promoted: bool,
    pub activated_version: Option<i64>,
    pub reasons: Vec<String>,
}

/// Drives the drift → collect → analyze → propose → evaluate → shadow →
/// promote/rollback pipeline. The heavy lifting (LLM execution, traffic
/// comparison) is delegated to the shadow runner and the invoker seam.
pub struct RetrainingOrchestrator {
    config: RetrainingConfig,
    store: Arc<Store>,
}

impl RetrainingOrchestrator {
    pub fn new(config: RetrainingConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    /// Gate: high drift severity (or two medium drifts, which the severity
    /// ladder already encodes) plus an elapsed per-variant cooldown.
    pub fn should_retrain(
        &self,
        analysis: &DriftAnalysis,
    ) -> Result<ShouldRetrain, LifecycleError> {
        let mut reasons = Vec::new();

        let severity_ok = analysis.severity >= DriftSeverity::Medium && analysis.overall_drift;
        if !severity_ok {
            reasons.push(format!(
                "drift severity {} below retraining bar",
                analysis.severity.as_str()
            ));
        }

        if let Some(last) = self.store.last_retraining_session(&analysis.variant)? {
            let started = chrono::DateTime::parse_from_rfc3339(&last.started_at)
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now());
            let cooldown = chrono::Duration::days(self.config.cooldown_days);
            if chrono::Utc::now() - started < cooldown {
                reasons.push(format!(
                    "cooldown active: last retraining started {}",
                    last.started_at
                ));
            }
        }

        Ok(ShouldRetrain {
            should_retrain: reasons.is_empty(),
            reasons,
        })
    }

    /// Phases (i)–(vi): collect data, analyze failures, propose and register
    /// a candidate prompt, evaluate it offline, then start a shadow run.
    #[instrument(skip(self, invoker, shadow))]
    pub async fn start(
        &self,
        variant: &str,
        invoker: &dyn ShadowInvoker,
        shadow: &ShadowRunner,
    ) -> Result<RetrainingStartReport, LifecycleError> {
        let active = self
            .store
            .get_active_version(variant)?
            .ok_or_else(|| LifecycleError::UnknownVariant(variant.to_string()))?;

        let session_id = format!("retrain-{}", Uuid::new_v4());
        self.store.insert_retraining_session(&session_id, variant)?;

        // (i) Collect recent conversations.
        let conversations = self
            .store
            .recent_conversations(variant, self.config.max_training_conversations)?;
        let data_size = conversations.len();

        // (ii) Failure-pattern analysis over escalated / unbooked sessions.
        let analysis = self.analyze_failures(&conversations)?;
        let analysis_json = serde_json::to_string(&analysis).unwrap_or_default();
        self.store.update_retraining_session(
            &session_id,
            "collecting_data",
            None,
            Some(data_size as i64),
            Some(&analysis_json),
            None,
            None,
            None,
        )?;

        // (iii) Propose a new prompt annotated with failure guidance.
        let candidate_prompt = annotate_prompt(&active.system_prompt, &analysis);
        let next_version = self.store.max_version(variant)?.unwrap_or(0) + 1;

        // (iv) Register the candidate under a dedicated variant name so the
        // shadow runner can execute it without touching the live variant.
        let candidate_variant = format!("{variant}-candidate-v{next_version}");
        let metadata = serde_json::json!({
            "candidate_for": variant,
            "target_version": next_version,
            "retraining_session": session_id,
        });
        let v = self
            .store
            .register_version(&candidate_variant, &candidate_prompt, &metadata)?;
        self.store.activate_version(&candidate_variant, v)?;

        // (v) Offline evaluation against the canned cases.
        let eval_score = self.evaluate(&candidate_variant, invoker).await;
        if eval_score < self.config.eval_pass_score {
            self.store.update_retraining_session(
                &session_id,
                "failed",
                Some(next_version),
                None,
                None,
                Some(&candidate_variant),
                None,
                Some(false),
            )?;
            return Err(LifecycleError::EvaluationFailed(format!(
                "offline eval score {eval_score:.2} below {:.2}",
                self.config.eval_pass_score
            )));
        }

        // (vi) Shadow deployment on full traffic sampling.
        shadow.start(variant, &candidate_variant, 100.0);
        self.store.update_retraining_session(
            &session_id,
            "shadow_testing",
            Some(next_version),
            None,
            None,
            Some(&candidate_variant),
            None,
            None,
        )?;

        info!(
            variant,
            candidate_variant, eval_score, "retraining candidate in shadow testing"
        );
        Ok(RetrainingStartReport {
            session_id,
            variant: variant.to_string(),
            candidate_variant,
            next_version,
            training_data_size: data_size,
            failure_analysis: analysis,
            eval_score,
            status: "shadow_testing".to_string(),
        })
    }

    /// Phases (vii)–(viii): apply the shadow promotion criteria, then either
    /// register+activate the candidate prompt as the variant's next version
    /// or roll the session back.
    #[instrument(skip(self, shadow))]
    pub fn finalize(
        &self,
        session_id: &str,
        shadow: &ShadowRunner,
    ) -> Result<RetrainingFinalizeReport, LifecycleError> {
        let session = self
            .store
            .get_retraining_session(session_id)?
            .ok_or_else(|| LifecycleError::SessionNotFound(session_id.to_string()))?;
        let candidate_variant = session.new_variant.clone().ok_or_else(|| {
            LifecycleError::RetrainingBlocked("session has no candidate variant".to_string())
        })?;

        let check = shadow
            .promotion_check()?
            .ok_or_else(|| LifecycleError::RetrainingBlocked("no active shadow run".to_string()))?;
        let shadow_json = serde_json::to_string(&check).unwrap_or_default();
        shadow.stop();

        if check.should_promote {
            let candidate = self
                .store
                .get_active_version(&candidate_variant)?
                .ok_or_else(|| LifecycleError::UnknownVariant(candidate_variant.clone()))?;
            let metadata = serde_json::json!({
                "retraining_session": session_id,
                "promoted_from": candidate_variant,
            });
            let version =
                self.store
                    .register_version(&session.variant, &candidate.system_prompt, &metadata)?;
            self.store.activate_version(&session.variant, version)?;
            self.store.update_retraining_session(
                session_id,
                "promoted",
                Some(version),
                None,
                None,
                None,
                Some(&shadow_json),
                Some(true),
            )?;
            info!(variant = %session.variant, version, "retrained prompt promoted");
            Ok(RetrainingFinalizeReport {
                session_id: session_id.to_string(),
                promoted: true,
                activated_version: Some(version),
                reasons: Vec::new(),
            })
        } else {
            self.store.update_retraining_session(
                session_id,
                "rolled_back",
                None,
                None,
                None,
                None,
                Some(&shadow_json),
                Some(false),
            )?;
            warn!(variant = %session.variant, reasons = ?check.reasons, "retraining rolled back");
            Ok(RetrainingFinalizeReport {
                session_id: session_id.to_string(),
                promoted: false,
                activated_version: None,
                reasons: check.reasons,
            })
        }
    }

    async fn evaluate(&self, candidate_variant: &str, invoker: &dyn ShadowInvoker) -> f64 {
        let mut score_sum = 0.0;
        let mut ran = 0usize;
        for (input, expected_action) in EVAL_CASES {
            ran += 1;
            match invoker.invoke(candidate_variant, input).await {
                Ok(reply) if reply.action == expected_action => score_sum += 1.0,
                Ok(reply) if !reply.message.is_empty() => score_sum += 0.5,
                Ok(_) => {}
                Err(e) => warn!(err = %e, case = input, "eval case failed"),
            }
        }
        if ran == 0 {
            return 0.0;
        }
        score_sum / ran as f64
    }

    /// Bucket failed conversations (escalated or never booked) by keyword
    /// categories over their message text.
    fn analyze_failures(
        &self,
        conversations: &[sparkle_store::Conversation],
    ) -> Result<FailureAnalysis, LifecycleError> {
        let mut categories: HashMap<String, usize> = HashMap::new();
        let mut failures = 0usize;

        for conversation in conversations {
            let failed = conversation.escalated_to_human || !conversation.booking_completed;
            if !failed {
                continue;
            }
            failures += 1;
            let messages = self.store.list_messages(&conversation.id)?;
            let text: String = messages
                .iter()
                .map(|m| m.content.to_lowercase())
                .collect::<Vec<_>>()
                .join(" ");
            for (category, keywords) in CATEGORIES {
                if keywords.iter().any(|k| text.contains(k)) {
                    *categories.entry(category.to_string()).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = categories.clone().into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let top_categories = ranked.into_iter().take(2).map(|(c, _)| c).collect();

        Ok(FailureAnalysis {
            conversations_scanned: conversations.len(),
            failures,
            categories,
            top_categories,
        })
    }
}

/// Append targeted guidance for the top failure categories to the current
/// prompt. Deterministic; the real prompt-search method is out of scope.
fn annotate_prompt(current: &str, analysis: &FailureAnalysis) -> String {
    let mut prompt = current.to_string();
    if analysis.top_categories.is_empty() {
        return prompt;
    }
    prompt.push_str("\n\nAdditional guidance from recent conversations:\n");
    for category in &analysis.top_categories {
        let line = match category.as_str() {
            "pricing" => {
                "- Be upfront about pricing ranges and offer a quote before asking for a booking."
            }
            "availability" => {
                "- Offer at least two concrete alternative time slots when the requested one is taken."
            }
            "clarity" => {
                "- Use short sentences and confirm your understanding of the request before moving on."
            }
            "technical" => {
                "- If something goes wrong, apologize once and offer to connect the customer with a human."
            }
            _ => continue,
        };
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sparkle_core::config::ShadowConfig;
    use sparkle_rollout::ShadowReply;

    struct PerfectInvoker;

    #[async_trait]
    impl ShadowInvoker for PerfectInvoker {
        async fn invoke(&self, _variant: &str, user_message: &str) -> Result<ShadowReply, String> {
            let action = EVAL_CASES
                .iter()
                .find(|(input, _)| *input == user_message)
                .map(|(_, action)| *action)
                .unwrap_or("collect_info");
            Ok(ShadowReply {
                message: "sure".to_string(),
                action: action.to_string(),
                duration_ms: 50,
                cost_usd: 0.0001,
            })
        }
    }

    struct UselessInvoker;

    #[async_trait]
    impl ShadowInvoker for UselessInvoker {
        async fn invoke(&self, _variant: &str, _user_message: &str) -> Result<ShadowReply, String> {
            Ok(ShadowReply {
                message: String::new(),
                action: "continue".to_string(),
                duration_ms: 50,
                cost_usd: 0.0001,
            })
        }
    }

    fn setup(store: &Arc<Store>) {
        let meta = serde_json::json!({});
        let v = store
            .register_version("baseline", "You are a scheduling assistant.", &meta)
            .unwrap();
        store.activate_version("baseline", v).unwrap();
    }

    #[tokio::test]
    async fn start_registers_candidate_and_enters_shadow() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        setup(&store);
        let orchestrator =
            RetrainingOrchestrator::new(RetrainingConfig::default(), store.clone());
        let invoker = Arc::new(PerfectInvoker);
        let shadow = ShadowRunner::new(ShadowConfig::default(), store.clone(), invoker.clone());

        let report = orchestrator
            .start("baseline", invoker.as_ref(), &shadow)
            .await
            .unwrap();
        assert_eq!(report.status, "shadow_testing");
        assert_eq!(report.next_version, 2);
        assert!(report.eval_score >= 0.8);
        assert!(shadow.status().is_some());

        let session = store
            .get_retraining_session(&report.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.status, "shadow_testing");
        assert!(store
            .get_active_version(&report.candidate_variant)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failing_eval_marks_session_failed() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        setup(&store);
        let orchestrator =
            RetrainingOrchestrator::new(RetrainingConfig::default(), store.clone());
        let invoker = Arc::new(UselessInvoker);
        let shadow = ShadowRunner::new(ShadowConfig::default(), store.clone(), invoker.clone());

        let err = orchestrator
            .start("baseline", invoker.as_ref(), &shadow)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::EvaluationFailed(_)));
        let last = store.last_retraining_session("baseline").unwrap().unwrap();
        assert_eq!(last.status, "failed");
    }

    #[test]
    fn annotation_appends_guidance_for_top_categories() {
        let analysis = FailureAnalysis {
            conversations_scanned: 100,
            failures: 40,
            categories: [("pricing".to_string(), 20), ("clarity".to_string(), 8)]
                .into_iter()
                .collect(),
            top_categories: vec!["pricing".to_string(), "clarity".to_string()],
        };
        let annotated = annotate_prompt("Base prompt.", &analysis);
        assert!(annotated.starts_with("Base prompt."));
        assert!(annotated.contains("pricing ranges"));
        assert!(annotated.contains("short sentences"));
    }
}
