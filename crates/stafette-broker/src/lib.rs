//! Broker adapter for the Stafette event backbone.
//!
//! Models an AMQP 0-9-1 topic-exchange broker: one durable exchange for
//! primary traffic (`events`), one for dead letters (`events.dlq`),
//! durable per-subscriber queues bound by routing key, persistent
//! delivery, and manual acknowledgement.
//!
//! Two implementations share the [`Broker`] contract:
//! - [`amqp::AmqpBroker`] speaks the wire protocol for production;
//! - [`memory::MemoryBroker`] provides identical semantics in-process for
//!   tests and single-process deployments.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod amqp;
pub mod error;
pub mod memory;
pub mod message;
pub mod topic;

use async_trait::async_trait;

pub use error::BrokerError;
pub use message::{Acker, Delivery, MessageHeaders};

/// Publish/consume contract over a topic-exchange broker.
///
/// The broker fans a published message out to every queue whose binding
/// pattern matches the routing key. Publish failures are returned to the
/// caller, which decides whether to retry (the dispatcher schedules a
/// backoff; the consumer runtime escalates to the dead-letter path).
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes persistently to the primary exchange.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError>;

    /// Publishes to the dead-letter exchange.
    ///
    /// The original error string and the failing stage identifier are
    /// carried in message headers alongside whatever `headers` already
    /// holds (trace id, retry count).
    async fn publish_dlq(
        &self,
        routing_key: &str,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError>;

    /// Declares `queue` durably, binds it to the primary exchange on
    /// `routing_key`, declares the matching dead-letter queue, and returns
    /// a manually-acknowledged delivery stream.
    async fn open_consumer(
        &self,
        queue: &str,
        routing_key: &str,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Liveness predicate used by readiness probes.
    fn is_connected(&self) -> bool;
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Waits for the next delivery. `None` means the stream has closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}
