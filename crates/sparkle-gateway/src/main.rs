use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Datelike;
use clap::Parser;
use sparkle_cache::ResponseCache;
use sparkle_core::config::SparkleConfig;
use sparkle_core::ChatMessage;
use sparkle_cost::{BudgetManager, CostOptimizer, RequestBatcher};
use sparkle_engine::{prompt, ConversationEngine};
use sparkle_lifecycle::{DriftDetector, RetrainingOrchestrator, VersionRegistry};
use sparkle_llm::{ChatCompleter, CompletionRequest, LlmClient};
use sparkle_reliability::{
    breaker::spawn_health_probe, BreakerRegistry, ErrorClassifier, OperationError,
    ReliabilityMetrics, RetryBudget, RetryPolicy, RetryPolicyConfig,
};
use sparkle_rollout::{CanaryController, ShadowInvoker, ShadowRunner};
use sparkle_safety::{SafetyMetrics, SafetyPipeline};
use sparkle_store::Store;
use tokio::sync::watch;
use tracing::{info, warn};

mod app;
mod http;
mod invoker;
mod tasks;

use app::AppState;
use invoker::EngineInvoker;

#[derive(Parser)]
#[command(name = "sparkle-gateway", about = "Conversational booking agent gateway")]
struct Args {
    /// Path to sparkle.toml. Defaults to ./sparkle.toml, then SPARKLE_* env.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sparkle_gateway=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("SPARKLE_CONFIG").ok());
    let config = SparkleConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        SparkleConfig::default()
    });

    // Fatal startup requirements: store, schema, LLM credential, port bind.
    let store = Arc::new(Store::open(&config.database.path)?);
    prompt::seed_variant(&store, &config.agent.default_variant)
        .map_err(|e| anyhow::anyhow!("prompt seeding failed: {e}"))?;
    let llm: Arc<dyn ChatCompleter> = Arc::new(LlmClient::from_config(&config.llm)?);

    let classifier = Arc::new(ErrorClassifier::new());
    let reliability_metrics = Arc::new(ReliabilityMetrics::new());
    let safety_metrics = Arc::new(SafetyMetrics::new());
    let safety = Arc::new(SafetyPipeline::new(
        config.safety.clone(),
        safety_metrics.clone(),
        store.clone(),
    ));
    let cache = Arc::new(ResponseCache::new(config.cache.clone(), store.clone()));

    let retry_budget = RetryBudget::new(
        config.reliability.retry_budget,
        Duration::from_secs(config.reliability.retry_budget_window_secs),
    );
    let retry = RetryPolicy::new(
        RetryPolicyConfig::from_name(&config.reliability.retry_profile),
        retry_budget.clone(),
        classifier.clone(),
    );
    let breakers = Arc::new(BreakerRegistry::new(config.reliability.breaker.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let batcher = config
        .batch
        .enabled
        .then(|| RequestBatcher::spawn(config.batch.clone(), llm.clone(), shutdown_rx.clone()));

    let budget = BudgetManager::new(config.budget.clone());
    seed_budget(&budget, &store);
    let optimizer = Arc::new(CostOptimizer::new(
        &config.router,
        &config.llm,
        budget,
        batcher,
    ));

    let config_arc = Arc::new(config.clone());
    let engine = Arc::new(ConversationEngine::new(
        config_arc,
        store.clone(),
        llm.clone(),
        safety.clone(),
        cache.clone(),
        optimizer.clone(),
        classifier.clone(),
        reliability_metrics.clone(),
        breakers.clone(),
        retry,
    ));

    let invoker: Arc<dyn ShadowInvoker> = Arc::new(EngineInvoker::new(engine.clone(), &config.llm));
    let shadow = Arc::new(ShadowRunner::new(
        config.rollout.shadow.clone(),
        store.clone(),
        invoker.clone(),
    ));
    let canary = Arc::new(CanaryController::new(
        config.rollout.canary.clone(),
        store.clone(),
    ));
    let drift = Arc::new(DriftDetector::new(
        config.lifecycle.drift.clone(),
        store.clone(),
    ));
    let retraining = Arc::new(RetrainingOrchestrator::new(
        config.lifecycle.retraining.clone(),
        store.clone(),
    ));
    let registry = Arc::new(VersionRegistry::new(store.clone()));

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(AppState {
        config,
        store,
        engine,
        cache,
        optimizer,
        safety,
        safety_metrics,
        reliability_metrics,
        breakers: breakers.clone(),
        retry_budget,
        shadow,
        canary,
        invoker,
        drift,
        retraining,
        registry,
        started_at: Instant::now(),
    });

    let mut handles = tasks::spawn_background(state.clone(), shutdown_rx.clone());
    handles.push(spawn_llm_health_probe(&state, llm, shutdown_rx));

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("sparkle gateway listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain background loops within the bounded stop window.
    let _ = shutdown_tx.send(true);
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("background tasks did not drain before the stop timeout");
    }
    info!("sparkle gateway stopped");
    Ok(())
}

/// Restore today's and this month's spend so restarts don't reset the caps.
fn seed_budget(budget: &BudgetManager, store: &Store) {
    let now = chrono::Utc::now();
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().to_rfc3339())
        .unwrap_or_else(|| now.to_rfc3339());
    let month_start = now
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc().to_rfc3339())
        .unwrap_or_else(|| now.to_rfc3339());
    match (
        store.total_cost_since(&day_start),
        store.total_cost_since(&month_start),
    ) {
        (Ok(daily), Ok(monthly)) => {
            budget.seed(daily, monthly);
            info!(daily, monthly, "budget counters seeded from store");
        }
        _ => warn!("budget seeding failed, starting counters at zero"),
    }
}

/// Out-of-band probe that can close the LLM breaker without user traffic.
fn spawn_llm_health_probe(
    state: &Arc<AppState>,
    llm: Arc<dyn ChatCompleter>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let breaker = state.breakers.get_or_create("llm");
    let interval =
        Duration::from_secs(state.config.reliability.breaker.health_probe_interval_secs.max(1));
    let model = state.config.llm.fast.id.clone();
    spawn_health_probe(
        breaker,
        interval,
        move || {
            let llm = llm.clone();
            let model = model.clone();
            async move {
                llm.complete(&CompletionRequest {
                    model,
                    messages: vec![ChatMessage::user("ping")],
                    temperature: 0.0,
                    max_tokens: 1,
                    json_response: false,
                })
                .await
                .map(|_| ())
                .map_err(OperationError::from)
            }
        },
        shutdown,
    )
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
