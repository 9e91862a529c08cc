//! Outbox dispatcher: the single-writer drain loop.
//!
//! Wakes on an interval, fetches due pending events oldest-first, and
//! publishes each through the broker with trace headers propagated from
//! the payload. A publish failure schedules that event's retry and moves
//! on; one bad event never stalls the batch. One dispatcher instance runs
//! per deployment.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::OutboxStore;
use stafette_broker::{Broker, BrokerError, MessageHeaders};
use stafette_core::{trace, Clock, OutboxEvent};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause between drain ticks.
    pub interval: Duration,

    /// Maximum events fetched per tick.
    pub batch_size: usize,

    /// Publish attempts before an event is terminally failed.
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), batch_size: 100, max_retries: 5 }
    }
}

/// Snapshot of dispatcher activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Events fetched from the outbox.
    pub fetched: u64,

    /// Events published and marked sent.
    pub published: u64,

    /// Publish attempts that failed and were scheduled for retry or
    /// terminally failed.
    pub publish_failures: u64,
}

#[derive(Default)]
struct Counters {
    fetched: std::sync::atomic::AtomicU64,
    published: std::sync::atomic::AtomicU64,
    publish_failures: std::sync::atomic::AtomicU64,
}

/// Background task draining the outbox to the broker.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    counters: Counters,
}

impl Dispatcher {
    /// Creates a dispatcher. `cancel` terminates the loop between ticks.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self { store, broker, config, clock, cancel, counters: Counters::default() }
    }

    /// Activity counters for monitoring.
    pub fn stats(&self) -> DispatcherStats {
        use std::sync::atomic::Ordering;

        DispatcherStats {
            fetched: self.counters.fetched.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    /// Runs the drain loop until cancellation.
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox dispatcher starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.interval) => {},
                () = self.cancel.cancelled() => break,
            }

            self.process_pending().await;
        }

        info!("outbox dispatcher stopped");
    }

    /// Drains one batch. Returns how many events were fetched.
    pub async fn process_pending(&self) -> usize {
        let events = match self.store.fetch_due(self.config.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to fetch due outbox events");
                return 0;
            },
        };

        if events.is_empty() {
            return 0;
        }

        debug!(count = events.len(), "processing pending outbox events");

        let fetched = events.len();
        self.counters.fetched.fetch_add(fetched as u64, std::sync::atomic::Ordering::Relaxed);

        for event in events {
            // Let a shutdown signal take effect between events; anything
            // unpublished stays pending for the next process.
            if self.cancel.is_cancelled() {
                break;
            }

            match publish_event(self.broker.as_ref(), &event).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if let Err(e) = self.store.mark_sent(event.id).await {
                        error!(event_id = %event.id, error = %e, "failed to mark event sent");
                    } else {
                        debug!(
                            event_id = %event.id,
                            routing_key = %event.routing_key,
                            "outbox event published"
                        );
                    }
                },
                Err(e) => {
                    self.counters
                        .publish_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    error!(
                        event_id = %event.id,
                        routing_key = %event.routing_key,
                        retry_count = event.retry_count,
                        error = %e,
                        "failed to publish outbox event"
                    );

                    if let Err(mark_err) =
                        self.store.mark_failed_attempt(event.id, self.config.max_retries).await
                    {
                        error!(
                            event_id = %event.id,
                            error = %mark_err,
                            "failed to record publish failure"
                        );
                    }
                },
            }
        }

        fetched
    }
}

/// Publishes one outbox event with trace headers from its payload.
pub(crate) async fn publish_event(
    broker: &dyn Broker,
    event: &OutboxEvent,
) -> Result<(), BrokerError> {
    let headers = MessageHeaders::with_trace(trace::from_payload(&event.payload));
    let body = serde_json::to_vec(&event.payload)
        .map_err(|e| BrokerError::Publish(format!("unserializable payload: {e}")))?;

    broker.publish(&event.routing_key, &body, &headers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MemoryOutboxStore;
    use stafette_broker::memory::MemoryBroker;
    use stafette_core::{time::RealClock, EventStatus, NewEvent};

    fn dispatcher(
        store: Arc<MemoryOutboxStore>,
        broker: MemoryBroker,
        config: DispatcherConfig,
    ) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(broker),
            config,
            Arc::new(RealClock),
            CancellationToken::new(),
        )
    }

    fn append(store: &MemoryOutboxStore, routing_key: &str, payload: serde_json::Value) -> i64 {
        store
            .append(NewEvent::new("email", Some(1), routing_key, &payload).unwrap())
            .id
            .0
    }

    #[tokio::test]
    async fn publishes_due_events_in_order_and_marks_sent() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");

        let first = append(&store, "email.received", serde_json::json!({"email_id": 1}));
        let second = append(&store, "email.received", serde_json::json!({"email_id": 2}));

        let d = dispatcher(store.clone(), broker.clone(), DispatcherConfig::default());
        assert_eq!(d.process_pending().await, 2);

        assert_eq!(store.event(first.into()).unwrap().status, EventStatus::Sent);
        assert_eq!(store.event(second.into()).unwrap().status, EventStatus::Sent);

        let head = broker.pop_queued("email.received.q").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&head.body).unwrap();
        assert_eq!(body["email_id"], 1);
        assert_eq!(broker.queue_depth("email.received.q"), 1);

        // A second pass sees nothing left.
        assert_eq!(d.process_pending().await, 0);
    }

    #[tokio::test]
    async fn empty_fetch_does_no_work() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();

        let d = dispatcher(store, broker, DispatcherConfig::default());
        assert_eq!(d.process_pending().await, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");

        let first = append(&store, "email.received", serde_json::json!({"email_id": 1}));
        let second = append(&store, "email.received", serde_json::json!({"email_id": 2}));
        let third = append(&store, "email.received", serde_json::json!({"email_id": 3}));

        // First publish of the tick fails; it targets the oldest event.
        broker.inject_publish_failures(1);

        let d = dispatcher(store.clone(), broker.clone(), DispatcherConfig::default());
        d.process_pending().await;

        let failed = store.event(first.into()).unwrap();
        assert_eq!(failed.status, EventStatus::Pending);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.next_retry_at.is_some());

        assert_eq!(store.event(second.into()).unwrap().status, EventStatus::Sent);
        assert_eq!(store.event(third.into()).unwrap().status, EventStatus::Sent);
        assert_eq!(broker.queue_depth("email.received.q"), 2);

        assert_eq!(
            d.stats(),
            DispatcherStats { fetched: 3, published: 2, publish_failures: 1 }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_event_failed() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();

        let id = append(&store, "email.received", serde_json::json!({"email_id": 1}));
        broker.set_connected(false);

        let config = DispatcherConfig { max_retries: 2, ..Default::default() };
        let d = dispatcher(store.clone(), broker.clone(), config);

        // Each pass is one failed attempt; make the event due again between
        // passes by resetting its retry schedule.
        d.process_pending().await;
        assert_eq!(store.event(id.into()).unwrap().status, EventStatus::Pending);

        store.set_now(chrono::Utc::now() + chrono::Duration::seconds(60));
        d.process_pending().await;

        let snapshot = store.event(id.into()).unwrap();
        assert_eq!(snapshot.status, EventStatus::Failed);
        assert_eq!(snapshot.retry_count, 2);
        assert!(snapshot.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn trace_id_is_lifted_from_payload_into_headers() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");

        append(
            &store,
            "email.received",
            serde_json::json!({"email_id": 1, "trace_id": "0af7651916cd43dd8448eb211c80319c"}),
        );

        let d = dispatcher(store, broker.clone(), DispatcherConfig::default());
        d.process_pending().await;

        let message = broker.pop_queued("email.received.q").unwrap();
        assert_eq!(
            message.headers.trace_id.as_deref(),
            Some("0af7651916cd43dd8448eb211c80319c")
        );
        assert!(message.headers.traceparent.is_some());
    }

    #[tokio::test]
    async fn fetch_failures_are_swallowed_and_retried_next_tick() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");

        append(&store, "email.received", serde_json::json!({"email_id": 1}));
        store.inject_fetch_failures(1);

        let d = dispatcher(store.clone(), broker.clone(), DispatcherConfig::default());
        assert_eq!(d.process_pending().await, 0);
        assert_eq!(d.process_pending().await, 1);
        assert_eq!(broker.queue_depth("email.received.q"), 1);
    }

    #[tokio::test]
    async fn run_loop_terminates_on_cancellation() {
        let store = Arc::new(MemoryOutboxStore::new());
        let broker = MemoryBroker::new();
        broker.bind_queue("email.received.q", "email.received");
        append(&store, "email.received", serde_json::json!({"email_id": 1}));

        let cancel = CancellationToken::new();
        let d = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(broker.clone()),
            DispatcherConfig { interval: Duration::from_millis(5), ..Default::default() },
            Arc::new(RealClock),
            cancel.clone(),
        ));

        let handle = tokio::spawn({
            let d = d.clone();
            async move { d.run().await }
        });

        // Give the loop a couple of ticks to drain the event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop after cancellation")
            .unwrap();

        assert_eq!(broker.queue_depth("email.received.q"), 1);
    }
}
