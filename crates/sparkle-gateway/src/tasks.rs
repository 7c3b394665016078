//! Supervised background loops: cache sweeper, drift scheduler, canary
//! health tick. All exit promptly when the shutdown watch flips true.

use std::sync::Arc;
use std::time::Duration;

use sparkle_rollout::canary::TickOutcome;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::AppState;

pub fn spawn_background(
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_cache_sweeper(state.clone(), shutdown.clone()),
        spawn_drift_scheduler(state.clone(), shutdown.clone()),
        spawn_canary_health(state, shutdown),
    ]
}

/// Evicts expired cache rows and prunes stale jailbreak session history.
fn spawn_cache_sweeper(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.cache.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match state.cache.sweep() {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "cache sweep evicted expired entries");
                        }
                        Ok(_) => {}
                        Err(e) => error!(err = %e, "cache sweep failed"),
                    }
                    state.safety.jailbreak_detector().prune_sessions();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Runs the drift check for every known serving variant on the configured
/// cadence. Candidate variants from retraining are skipped.
fn spawn_drift_scheduler(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.lifecycle.drift.check_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it so startup
        // isn't front-loaded with a full scan.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let variants = match state.registry.variants() {
                        Ok(v) => v,
                        Err(e) => {
                            error!(err = %e, "variant listing failed for drift scan");
                            continue;
                        }
                    };
                    for variant in variants {
                        if variant.contains("-candidate-") {
                            continue;
                        }
                        match state.drift.detect(&variant) {
                            Ok(analysis) if analysis.overall_drift => {
                                warn!(
                                    variant,
                                    severity = analysis.severity.as_str(),
                                    "scheduled drift check flagged variant"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(err = %e, variant, "drift check failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("drift scheduler shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Drives canary auto-promotion and auto-rollback.
fn spawn_canary_health(
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.rollout.canary.health_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match state.canary.tick() {
                        Ok(TickOutcome::Idle) | Ok(TickOutcome::Waiting) => {}
                        Ok(TickOutcome::Promoted { to_stage }) => {
                            info!(to_stage, "canary auto-promoted");
                        }
                        Ok(TickOutcome::Completed) => {
                            info!("canary rollout completed");
                        }
                        Ok(TickOutcome::RolledBack) => {
                            warn!("canary auto-rolled back");
                        }
                        Ok(TickOutcome::HealthFailed) => {
                            warn!("canary health check failed (auto-rollback disabled)");
                        }
                        Err(e) => error!(err = %e, "canary tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("canary health loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}
