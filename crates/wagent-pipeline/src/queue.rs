//! Typed, stage-specific queues with at-least-once redelivery.
//!
//! Each stage owns one bounded mpsc channel. Handlers return a tagged
//! outcome; the worker loop decides ack/redeliver. Transient failures
//! are re-enqueued with exponential backoff and jitter until the
//! attempt budget runs out (the job ledger keeps the post-mortem).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wagent_core::types::JobStage;
use wagent_store::metrics::MetricsStore;

/// Base delay before the first redelivery.
const REDELIVERY_BACKOFF_BASE_MS: u64 = 1000;
/// Redelivery delay cap.
const REDELIVERY_BACKOFF_MAX_MS: u64 = 60_000;
/// Jitter fraction applied to each redelivery delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// How one stage attempt ended. The worker maps this to ack/redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Work finished; ack.
    Done,
    /// Auto-reply was paused; terminal, never retried, never an error.
    Suppressed,
    /// Worth retrying (timeouts, 5xx, network).
    Transient(String),
    /// Retrying cannot help (bad credentials, unknown agent); ack and move on.
    Permanent(String),
}

/// One queue message plus its delivery count (1-based).
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub payload: T,
    pub attempt: u32,
}

/// A stage's handler. Owns all job-ledger transitions for its stage;
/// the worker loop only routes outcomes.
#[async_trait]
pub trait StageHandler<T>: Send + Sync {
    fn stage(&self) -> JobStage;
    async fn handle(&self, delivery: &Delivery<T>) -> StageOutcome;
}

/// Sending half of a stage queue. Cheap to clone.
pub struct StageQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<Delivery<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for StageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

/// Receiving half, consumed by `run_workers`.
pub struct StageReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<Delivery<T>>>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for StageReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> StageReceiver<T> {
    /// Take the next delivery; `None` when every sender is gone.
    pub async fn recv(&self) -> Option<Delivery<T>> {
        let mut rx = self.rx.lock().await;
        let delivery = rx.recv().await;
        if delivery.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        delivery
    }
}

/// Create one stage queue with the given capacity.
pub fn stage_queue<T>(name: &'static str, capacity: usize) -> (StageQueue<T>, StageReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        StageQueue {
            name,
            tx,
            depth: Arc::clone(&depth),
        },
        StageReceiver {
            rx: Arc::new(Mutex::new(rx)),
            depth,
        },
    )
}

impl<T: Send + 'static> StageQueue<T> {
    /// Enqueue a fresh message (attempt 1). Fails when the queue is
    /// full or shut down; callers own the retry policy.
    pub fn enqueue(&self, payload: T) -> Result<(), String> {
        self.send_delivery(Delivery {
            payload,
            attempt: 1,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn send_delivery(&self, delivery: Delivery<T>) -> Result<(), String> {
        match self.tx.try_send(delivery) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(format!("{} enqueue failed: {}", self.name, e)),
        }
    }
}

/// Tuning for one stage's worker pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
}

/// Spawn `concurrency` workers draining one stage queue.
///
/// Shutdown: the cancellation token stops intake promptly; a handler
/// already running observes the same token through its context.
pub fn run_workers<T, H>(
    queue: StageQueue<T>,
    receiver: StageReceiver<T>,
    handler: Arc<H>,
    metrics: Arc<MetricsStore>,
    options: WorkerOptions,
    cancel: CancellationToken,
) where
    T: Clone + Send + 'static,
    H: StageHandler<T> + 'static,
{
    for worker_id in 0..options.concurrency {
        let queue = queue.clone();
        let receiver = receiver.clone();
        let handler = Arc::clone(&handler);
        let metrics = Arc::clone(&metrics);
        let options = options.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            debug!(stage = %handler.stage(), worker_id, "stage worker started");
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = receiver.recv() => match maybe {
                        Some(d) => d,
                        None => break,
                    },
                };

                let started = std::time::Instant::now();
                let outcome = handler.handle(&delivery).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                let ok = !matches!(
                    outcome,
                    StageOutcome::Transient(_) | StageOutcome::Permanent(_)
                );
                if let Err(e) = metrics.bump(handler.stage(), ok, latency_ms) {
                    warn!(stage = %handler.stage(), error = %e, "metrics bump failed");
                }

                match outcome {
                    StageOutcome::Done => {}
                    StageOutcome::Suppressed => {
                        debug!(stage = %handler.stage(), "delivery suppressed");
                    }
                    StageOutcome::Permanent(reason) => {
                        error!(
                            stage = %handler.stage(),
                            attempt = delivery.attempt,
                            reason,
                            "permanent stage failure, not retrying"
                        );
                    }
                    StageOutcome::Transient(reason) => {
                        if delivery.attempt >= options.max_attempts {
                            error!(
                                stage = %handler.stage(),
                                attempt = delivery.attempt,
                                reason,
                                "attempt budget exhausted, dropping delivery"
                            );
                            continue;
                        }
                        warn!(
                            stage = %handler.stage(),
                            attempt = delivery.attempt,
                            reason,
                            "transient stage failure, scheduling redelivery"
                        );
                        schedule_redelivery(
                            queue.clone(),
                            Delivery {
                                payload: delivery.payload.clone(),
                                attempt: delivery.attempt + 1,
                            },
                            cancel.clone(),
                        );
                    }
                }
            }
            info!(stage = %handler.stage(), worker_id, "stage worker stopped");
        });
    }
}

/// Re-enqueue after an exponential backoff with ±10 % jitter:
/// 1 s → 2 s → 4 s → … capped at 60 s.
fn schedule_redelivery<T: Send + 'static>(
    queue: StageQueue<T>,
    delivery: Delivery<T>,
    cancel: CancellationToken,
) {
    let exponent = delivery.attempt.saturating_sub(2).min(16);
    let base = REDELIVERY_BACKOFF_BASE_MS
        .saturating_mul(1u64 << exponent)
        .min(REDELIVERY_BACKOFF_MAX_MS);
    let jitter_span = (base as f64 * JITTER_FRACTION) as u64;
    let jitter = if jitter_span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_span * 2)
    };
    let delay = Duration::from_millis(base - jitter_span + jitter);

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                if let Err(e) = queue.send_delivery(delivery) {
                    error!(queue = queue.name(), error = %e, "redelivery enqueue failed");
                }
            }
        }
    });
}
