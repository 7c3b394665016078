use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sparkle_core::config::BatchConfig;
use sparkle_core::Role;
use sparkle_llm::{ChatCompleter, CompletionOutcome, CompletionRequest, LlmError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::complexity::estimate_tokens;

struct Pending {
    request: CompletionRequest,
    reply: oneshot::Sender<Result<CompletionOutcome, LlmError>>,
    enqueued_at: Instant,
}

struct Bucket {
    items: Vec<Pending>,
    deadline: Instant,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchStats {
    pub batches_dispatched: u64,
    pub requests_batched: u64,
    /// Token savings vs sending each request's system prompt separately.
    pub estimated_tokens_saved: u64,
}

/// Coalesces concurrent requests that share a system prompt into small
/// batches dispatched in parallel. Callers that drop their reply channel
/// (cancellation) are discarded at dispatch time.
pub struct RequestBatcher {
    tx: mpsc::Sender<Pending>,
    batches_dispatched: Arc<AtomicU64>,
    requests_batched: Arc<AtomicU64>,
    tokens_saved: Arc<AtomicU64>,
}

impl RequestBatcher {
    /// Spawn the batching worker. It drains until `shutdown` flips true.
    pub fn spawn(
        config: BatchConfig,
        completer: Arc<dyn ChatCompleter>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Pending>(256);
        let batcher = Arc::new(Self {
            tx,
            batches_dispatched: Arc::new(AtomicU64::new(0)),
            requests_batched: Arc::new(AtomicU64::new(0)),
            tokens_saved: Arc::new(AtomicU64::new(0)),
        });
        tokio::spawn(run_worker(
            config,
            completer,
            rx,
            shutdown,
            batcher.batches_dispatched.clone(),
            batcher.requests_batched.clone(),
            batcher.tokens_saved.clone(),
        ));
        batcher
    }

    /// Submit a request and wait for its demultiplexed result. Dropping the
    /// returned future cancels the submission cleanly.
    pub async fn submit(&self, request: CompletionRequest) -> Result<CompletionOutcome, LlmError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = Pending {
            request,
            reply: reply_tx,
            enqueued_at: Instant::now(),
        };
        self.tx
            .send(pending)
            .await
            .map_err(|_| LlmError::Unavailable("batcher is shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| LlmError::Unavailable("batch dispatch dropped".to_string()))?
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            requests_batched: self.requests_batched.load(Ordering::Relaxed),
            estimated_tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    config: BatchConfig,
    completer: Arc<dyn ChatCompleter>,
    mut rx: mpsc::Receiver<Pending>,
    mut shutdown: watch::Receiver<bool>,
    batches_dispatched: Arc<AtomicU64>,
    requests_batched: Arc<AtomicU64>,
    tokens_saved: Arc<AtomicU64>,
) {
    let window = Duration::from_millis(config.window_ms);
    let mut buckets: HashMap<String, Bucket> = HashMap::new();

    loop {
        let next_deadline = buckets.values().map(|b| b.deadline).min();
        tokio::select! {
            maybe = rx.recv() => {
                let Some(pending) = maybe else { break };
                let key = prompt_key(&pending.request);
                let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
                    items: Vec::new(),
                    deadline: pending.enqueued_at + window,
                });
                bucket.items.push(pending);
                if bucket.items.len() >= config.max_size {
                    let bucket = buckets.remove(&key).unwrap();
                    dispatch(
                        bucket,
                        completer.clone(),
                        &batches_dispatched,
                        &requests_batched,
                        &tokens_saved,
                    );
                }
            }
            _ = sleep_until_deadline(next_deadline), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<String> = buckets
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    if let Some(bucket) = buckets.remove(&key) {
                        dispatch(
                            bucket,
                            completer.clone(),
                            &batches_dispatched,
                            &requests_batched,
                            &tokens_saved,
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Flush everything pending before exit.
                    for (_, bucket) in buckets.drain() {
                        dispatch(
                            bucket,
                            completer.clone(),
                            &batches_dispatched,
                            &requests_batched,
                            &tokens_saved,
                        );
                    }
                    break;
                }
            }
        }
    }
    debug!("request batcher worker stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

/// Dispatch a bucket: all requests run in parallel, results demux back to
/// their callers. Cancelled callers (closed reply channels) are skipped.
fn dispatch(
    bucket: Bucket,
    completer: Arc<dyn ChatCompleter>,
    batches_dispatched: &Arc<AtomicU64>,
    requests_batched: &Arc<AtomicU64>,
    tokens_saved: &Arc<AtomicU64>,
) {
    let live: Vec<Pending> = bucket
        .items
        .into_iter()
        .filter(|p| !p.reply.is_closed())
        .collect();
    if live.is_empty() {
        return;
    }

    batches_dispatched.fetch_add(1, Ordering::Relaxed);
    requests_batched.fetch_add(live.len() as u64, Ordering::Relaxed);

    // The shared system prompt would have been sent once per request
    // sequentially; batching pays it once.
    if live.len() > 1 {
        let system_tokens = live[0]
            .request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| estimate_tokens(&m.content) as u64)
            .unwrap_or(0);
        tokens_saved.fetch_add(system_tokens * (live.len() as u64 - 1), Ordering::Relaxed);
    }

    for pending in live {
        let completer = completer.clone();
        tokio::spawn(async move {
            let result = completer.complete(&pending.request).await;
            if pending.reply.send(result).is_err() {
                warn!("batched caller went away before dispatch completed");
            }
        });
    }
}

/// Requests batch together when they share a system prompt and model.
fn prompt_key(request: &CompletionRequest) -> String {
    let system = request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update([0x1e]);
    hasher.update(system.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sparkle_core::{Action, ChatMessage};
    use sparkle_llm::Usage;

    struct EchoCompleter;

    #[async_trait]
    impl ChatCompleter for EchoCompleter {
        async fn complete(
            &self,
            req: &CompletionRequest,
        ) -> Result<CompletionOutcome, LlmError> {
            Ok(CompletionOutcome {
                message: req.messages.last().unwrap().content.clone(),
                action: Action::Continue,
                extracted: serde_json::json!({}),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                model: req.model.clone(),
            })
        }
    }

    fn request(user: &str) -> CompletionRequest {
        CompletionRequest {
            model: "fast".to_string(),
            messages: vec![
                ChatMessage::system("You are a scheduling assistant."),
                ChatMessage::user(user),
            ],
            temperature: 0.7,
            max_tokens: 100,
            json_response: false,
        }
    }

    #[tokio::test]
    async fn concurrent_requests_are_batched_and_demuxed() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = BatchConfig {
            enabled: true,
            window_ms: 20,
            max_size: 5,
        };
        let batcher = RequestBatcher::spawn(config, Arc::new(EchoCompleter), shutdown_rx);

        let a = batcher.submit(request("alpha"));
        let b = batcher.submit(request("bravo"));
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap().message, "alpha");
        assert_eq!(rb.unwrap().message, "bravo");

        let stats = batcher.stats();
        assert_eq!(stats.requests_batched, 2);
        assert!(stats.batches_dispatched >= 1);
    }

    #[tokio::test]
    async fn full_bucket_dispatches_before_window() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = BatchConfig {
            enabled: true,
            window_ms: 10_000,
            max_size: 2,
        };
        let batcher = RequestBatcher::spawn(config, Arc::new(EchoCompleter), shutdown_rx);

        let started = Instant::now();
        let (ra, rb) = tokio::join!(batcher.submit(request("a")), batcher.submit(request("b")));
        assert!(ra.is_ok() && rb.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
