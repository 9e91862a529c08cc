//! Per-queue consumer runtime.
//!
//! Drives the delivery state machine for one queue and one handler:
//!
//! ```text
//!   received ──decode fails──▶ DLQ(json_unmarshal_error) ──▶ ack
//!       │
//!   dedup.acquire(handler, entity_id)
//!       │ repeat ──▶ ack (skip)
//!       ▼ first
//!   handler.invoke (panic-shielded)
//!       │ success ─────────────▶ ack
//!       │ already-applied ─────▶ ack
//!       │ terminal ────────────▶ DLQ(reason) ──▶ ack
//!       │ retryable, below max ▶ requeue with x-retry-count + 1
//!       │ retryable, at max ───▶ DLQ(reason) ──▶ ack
//! ```
//!
//! Every delivery is settled exactly once; nothing is leaked even when
//! the handler panics. A cancellation signal stops intake, lets the
//! in-flight handler finish, and then completes `stop()`.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dedup::Deduper,
    handler::{EventHandler, HandlerContext},
};
use stafette_broker::{Broker, BrokerError, Delivery};
use stafette_core::classify::{classify, ErrorClass};

/// Consumer runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Redeliveries permitted before a retryable failure dead-letters.
    ///
    /// Tracked in the `x-retry-count` header; independent of the outbox
    /// dispatcher's publish retries.
    pub max_retries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Snapshot of one consumer's activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries acknowledged after successful or idempotent handling.
    pub acked: u64,

    /// Deliveries redelivered with an incremented retry count.
    pub requeued: u64,

    /// Deliveries routed to the dead-letter queue.
    pub dead_lettered: u64,

    /// Deliveries skipped by the dedup gate.
    pub duplicates_skipped: u64,

    /// Handler panics caught by the shield.
    pub panics: u64,
}

#[derive(Default)]
struct Counters {
    acked: std::sync::atomic::AtomicU64,
    requeued: std::sync::atomic::AtomicU64,
    dead_lettered: std::sync::atomic::AtomicU64,
    duplicates_skipped: std::sync::atomic::AtomicU64,
    panics: std::sync::atomic::AtomicU64,
}

impl Counters {
    fn bump(counter: &std::sync::atomic::AtomicU64) {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Worker loop for one queue.
pub struct ConsumerRuntime {
    broker: Arc<dyn Broker>,
    queue: String,
    routing_key: String,
    handler: Arc<dyn EventHandler>,
    deduper: Option<Arc<Deduper>>,
    config: ConsumerConfig,
    cancel: CancellationToken,
    done: Notify,
    finished: std::sync::atomic::AtomicBool,
    counters: Counters,
}

impl ConsumerRuntime {
    /// Creates a runtime binding `handler` to `routing_key` on `queue`.
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        deduper: Option<Arc<Deduper>>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            routing_key: routing_key.into(),
            handler,
            deduper,
            config,
            cancel: CancellationToken::new(),
            done: Notify::new(),
            finished: std::sync::atomic::AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Activity counters for monitoring.
    pub fn stats(&self) -> ConsumerStats {
        use std::sync::atomic::Ordering;

        ConsumerStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.counters.duplicates_skipped.load(Ordering::Relaxed),
            panics: self.counters.panics.load(Ordering::Relaxed),
        }
    }

    /// Consumes deliveries until stopped or the stream closes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the consumer cannot be opened; once
    /// consuming, failures are logged per delivery and the loop continues.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut stream = self.broker.open_consumer(&self.queue, &self.routing_key).await?;

        info!(
            queue = %self.queue,
            routing_key = %self.routing_key,
            handler = self.handler.name(),
            max_retries = self.config.max_retries,
            "consumer started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(queue = %self.queue, "consumer stopping");
                    break;
                }
                next = stream.next_delivery() => {
                    match next {
                        Some(Ok(delivery)) => self.process(delivery).await,
                        Some(Err(e)) => {
                            error!(queue = %self.queue, error = %e, "delivery receipt failed");
                        },
                        None => {
                            info!(queue = %self.queue, "delivery stream closed");
                            break;
                        },
                    }
                }
            }
        }

        self.finished.store(true, std::sync::atomic::Ordering::SeqCst);
        self.done.notify_waiters();
        info!(queue = %self.queue, "consumer stopped");
        Ok(())
    }

    /// Signals shutdown without waiting. [`ConsumerRuntime::stop`] is the
    /// graceful path; this exists for drop guards and fan-out stops.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits for the in-flight delivery to settle.
    pub async fn stop(&self) {
        self.signal_stop();

        loop {
            if self.finished.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let notified = self.done.notified();
            if self.finished.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn process(&self, delivery: Delivery) {
        let retry_count = delivery.headers.retry_count;

        debug!(
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            retry_count,
            size = delivery.body.len(),
            "processing delivery"
        );

        // Decode gate: a body that is not JSON can never succeed, so it
        // goes straight to the dead-letter queue.
        let payload: serde_json::Value = match serde_json::from_slice(&delivery.body) {
            Ok(value) => value,
            Err(decode_err) => {
                warn!(
                    queue = %self.queue,
                    error = %decode_err,
                    "undecodable payload, dead-lettering"
                );
                let reason = format!("json_unmarshal_error: {decode_err}");
                self.dead_letter(&delivery, &reason).await;
                return;
            },
        };

        // Dedup gate.
        if let (Some(deduper), Some(entity_id)) =
            (self.deduper.as_ref(), self.handler.entity_id(&payload))
        {
            if !deduper.acquire_once(self.handler.name(), entity_id).await {
                Counters::bump(&self.counters.duplicates_skipped);
                self.ack(&delivery).await;
                return;
            }
        }

        let ctx = HandlerContext {
            trace_id: delivery.headers.trace_id.clone(),
            retry_count,
            cancel: self.cancel.child_token(),
        };

        match self.invoke_shielded(ctx, payload).await {
            Invocation::Success => {
                debug!(queue = %self.queue, "delivery processed");
                self.ack(&delivery).await;
            },
            Invocation::Failed(err) => self.settle_failure(&delivery, &err).await,
            Invocation::Panicked(panic_msg) => {
                Counters::bump(&self.counters.panics);
                error!(
                    queue = %self.queue,
                    retry_count,
                    panic = %panic_msg,
                    "handler panicked"
                );

                // A panic is treated as retryable unless the delivery is
                // already at the ceiling.
                if retry_count >= self.config.max_retries {
                    self.dead_letter(&delivery, &format!("panic: {panic_msg}")).await;
                } else {
                    self.requeue(&delivery).await;
                }
            },
        }
    }

    /// Runs the handler in its own task so a panic unwinds there instead
    /// of tearing down the consume loop.
    async fn invoke_shielded(&self, ctx: HandlerContext, payload: serde_json::Value) -> Invocation {
        let handler = self.handler.clone();

        let join = tokio::spawn(async move { handler.handle(&ctx, &payload).await }).await;

        match join {
            Ok(Ok(())) => Invocation::Success,
            Ok(Err(err)) => Invocation::Failed(err),
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".to_string());
                Invocation::Panicked(message)
            },
            Err(_) => Invocation::Panicked("handler task cancelled".to_string()),
        }
    }

    async fn settle_failure(&self, delivery: &Delivery, err: &anyhow::Error) {
        let classified = classify(err);
        let retry_count = delivery.headers.retry_count;

        match classified.class {
            ErrorClass::AlreadyApplied => {
                info!(
                    queue = %self.queue,
                    label = classified.label,
                    "side effect already applied, acknowledging"
                );
                self.ack(delivery).await;
            },
            ErrorClass::Terminal => {
                warn!(
                    queue = %self.queue,
                    label = classified.label,
                    error = %err,
                    "terminal handler error, dead-lettering"
                );
                self.dead_letter(delivery, &format!("{}: {err:#}", classified.label)).await;
            },
            ErrorClass::Retryable => {
                if retry_count >= self.config.max_retries {
                    warn!(
                        queue = %self.queue,
                        retry_count,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "retry ceiling reached, dead-lettering"
                    );
                    self.dead_letter(delivery, &format!("{}: {err:#}", classified.label)).await;
                } else {
                    warn!(
                        queue = %self.queue,
                        retry_count,
                        label = classified.label,
                        error = %err,
                        "retryable handler error, redelivering"
                    );
                    self.requeue(delivery).await;
                }
            },
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        Counters::bump(&self.counters.acked);
        if let Err(e) = delivery.acker.ack().await {
            error!(queue = %self.queue, error = %e, "failed to ack delivery");
        }
    }

    async fn requeue(&self, delivery: &Delivery) {
        Counters::bump(&self.counters.requeued);
        let headers = delivery.headers.incremented();
        if let Err(e) = delivery.acker.requeue_with_retry(&delivery.body, &headers).await {
            error!(queue = %self.queue, error = %e, "failed to requeue delivery");
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        Counters::bump(&self.counters.dead_lettered);
        if let Err(e) =
            delivery.acker.dead_letter(&delivery.body, reason, &delivery.headers).await
        {
            error!(queue = %self.queue, error = %e, "failed to dead-letter delivery");
        }
    }
}

enum Invocation {
    Success,
    Failed(anyhow::Error),
    Panicked(String),
}

/// Spawns `runtime.run()` onto the current tokio runtime.
///
/// The embedding service keeps the returned handle for its shutdown
/// sequence; `runtime.stop()` remains the graceful path.
pub fn spawn(runtime: Arc<ConsumerRuntime>) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
    tokio::spawn(async move {
        let result = runtime.run().await;
        if let Err(e) = &result {
            error!(error = %e, "consumer terminated with error");
        }
        result
    })
}

/// Polling helper shared by the crate's tests.
#[cfg(test)]
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    use std::time::{Duration, Instant};

    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
