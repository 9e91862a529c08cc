//! In-process broker with topic-exchange semantics.
//!
//! Backs tests and single-process deployments with the same contract as
//! the AMQP adapter: wildcard bindings, per-queue FIFO, manual
//! acknowledgement, requeue with retry accounting, and dead-letter
//! routing. State is shared behind one lock that is never held across an
//! await point.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    error::BrokerError,
    message::{Acker, Delivery, MessageHeaders},
    topic, Broker, DeliveryStream,
};
use stafette_core::contracts;

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Routing key the message was published with.
    pub routing_key: String,

    /// Raw body.
    pub body: Vec<u8>,

    /// Well-known headers.
    pub headers: MessageHeaders,
}

struct QueueSlot {
    messages: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

impl QueueSlot {
    fn new() -> Self {
        Self { messages: VecDeque::new(), notify: Arc::new(Notify::new()) }
    }
}

struct Binding {
    pattern: String,
    queue: String,
}

struct State {
    connected: bool,
    closed: bool,
    publish_failures: u32,
    bindings: Vec<Binding>,
    dlq_bindings: Vec<Binding>,
    queues: HashMap<String, QueueSlot>,
    in_flight: usize,
}

impl State {
    fn ensure_queue(&mut self, name: &str) {
        self.queues.entry(name.to_string()).or_insert_with(QueueSlot::new);
    }

    fn ensure_binding(bindings: &mut Vec<Binding>, pattern: &str, queue: &str) {
        let exists = bindings.iter().any(|b| b.pattern == pattern && b.queue == queue);
        if !exists {
            bindings.push(Binding { pattern: pattern.to_string(), queue: queue.to_string() });
        }
    }

    fn target_queues(bindings: &[Binding], routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in bindings {
            if topic::matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, queue: &str, message: QueuedMessage) {
        if let Some(slot) = self.queues.get_mut(queue) {
            slot.messages.push_back(message);
            slot.notify.notify_waiters();
        }
    }
}

/// In-memory topic broker.
#[derive(Clone)]
pub struct MemoryBroker {
    stage: Arc<str>,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates a broker whose dead-letter stage identifier is `worker`.
    pub fn new() -> Self {
        Self::with_stage("worker")
    }

    /// Creates a broker with an explicit dead-letter stage identifier.
    pub fn with_stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Arc::from(stage.into()),
            state: Arc::new(Mutex::new(State {
                connected: true,
                closed: false,
                publish_failures: 0,
                bindings: Vec::new(),
                dlq_bindings: Vec::new(),
                queues: HashMap::new(),
                in_flight: 0,
            })),
        }
    }

    /// Declares a queue and binds it to the primary exchange.
    ///
    /// Subscribers normally declare through [`Broker::open_consumer`]; this
    /// exists so tests can bind a queue before any consumer attaches.
    pub fn bind_queue(&self, queue: &str, pattern: &str) {
        let mut state = self.lock();
        state.ensure_queue(queue);
        State::ensure_binding(&mut state.bindings, pattern, queue);
    }

    /// Number of messages waiting in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |slot| slot.messages.len())
    }

    /// Whether `queue` has been declared.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Removes and returns the head of `queue` without acknowledgement
    /// bookkeeping. Test inspection only.
    pub fn pop_queued(&self, queue: &str) -> Option<QueuedMessage> {
        self.lock().queues.get_mut(queue).and_then(|slot| slot.messages.pop_front())
    }

    /// Deliveries handed out but not yet resolved by their acker.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Simulates connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Makes the next `count` publishes fail with a publish error.
    pub fn inject_publish_failures(&self, count: u32) {
        self.lock().publish_failures = count;
    }

    /// Closes the broker: open delivery streams end after draining.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for slot in state.queues.values() {
            slot.notify.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fan_out(&self, routing_key: &str, message: QueuedMessage, dead_letter: bool) {
        let mut state = self.lock();
        let targets = if dead_letter {
            State::target_queues(&state.dlq_bindings, routing_key)
        } else {
            State::target_queues(&state.bindings, routing_key)
        };

        for queue in targets {
            state.enqueue(&queue, message.clone());
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if !state.connected || state.closed {
                return Err(BrokerError::Connection("broker not connected".to_string()));
            }
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                return Err(BrokerError::Publish("injected publish failure".to_string()));
            }
        }

        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            headers: headers.clone(),
        };
        self.fan_out(routing_key, message, false);
        Ok(())
    }

    async fn publish_dlq(
        &self,
        routing_key: &str,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Connection("broker not connected".to_string()));
        }

        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            headers: headers.dead_lettered(original_error, &self.stage),
        };
        self.fan_out(routing_key, message, true);
        Ok(())
    }

    async fn open_consumer(
        &self,
        queue: &str,
        routing_key: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let notify = {
            let mut state = self.lock();
            if state.closed {
                return Err(BrokerError::Connection("broker closed".to_string()));
            }

            state.ensure_queue(queue);
            State::ensure_binding(&mut state.bindings, routing_key, queue);

            let dlq = contracts::dead_letter_queue(routing_key);
            state.ensure_queue(&dlq);
            State::ensure_binding(&mut state.dlq_bindings, routing_key, &dlq);

            state.queues[queue].notify.clone()
        };

        Ok(Box::new(MemoryDeliveryStream {
            broker: self.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    fn is_connected(&self) -> bool {
        let state = self.lock();
        state.connected && !state.closed
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            // Arm the waiter before checking the queue so a concurrent
            // enqueue cannot be missed.
            let notified = self.notify.notified();

            {
                let mut state = self.broker.lock();
                if let Some(message) =
                    state.queues.get_mut(&self.queue).and_then(|slot| slot.messages.pop_front())
                {
                    state.in_flight += 1;
                    let acker = MemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        routing_key: message.routing_key.clone(),
                    };
                    return Some(Ok(Delivery {
                        routing_key: message.routing_key,
                        queue: self.queue.clone(),
                        body: message.body,
                        headers: message.headers,
                        acker: Box::new(acker),
                    }));
                }

                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    routing_key: String,
}

impl MemoryAcker {
    fn settle(&self) {
        let mut state = self.broker.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle();
        Ok(())
    }

    async fn requeue_with_retry(
        &self,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let message = QueuedMessage {
            routing_key: self.routing_key.clone(),
            body: body.to_vec(),
            headers: headers.clone(),
        };
        state.enqueue(&self.queue, message);
        state.in_flight = state.in_flight.saturating_sub(1);
        Ok(())
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError> {
        let message = QueuedMessage {
            routing_key: self.routing_key.clone(),
            body: body.to_vec(),
            headers: headers.dead_lettered(original_error, &self.broker.stage),
        };
        self.broker.fan_out(&self.routing_key, message, true);
        self.settle();
        Ok(())
    }
}
