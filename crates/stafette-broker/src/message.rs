//! Message envelope: headers and the per-delivery acknowledgement handle.

use async_trait::async_trait;

use crate::error::BrokerError;
use stafette_core::trace::TraceId;

/// Well-known headers carried on every bus message.
///
/// The body is the opaque JSON payload; everything the backbone needs for
/// correlation and retry accounting travels here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Hex trace identifier propagated from the producing request.
    pub trace_id: Option<String>,

    /// W3C trace-context value for correlated tracing.
    pub traceparent: Option<String>,

    /// Consumer-level retry count. Zero on first delivery.
    pub retry_count: u32,

    /// Original error string; present only on dead-lettered messages.
    pub original_error: Option<String>,

    /// Pipeline stage that dead-lettered the message.
    pub failed_stage: Option<String>,
}

impl MessageHeaders {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers carrying a trace id, with `traceparent` synthesised when the
    /// id has the canonical 16-byte form.
    pub fn with_trace(trace_id: Option<String>) -> Self {
        let traceparent =
            trace_id.as_deref().and_then(TraceId::parse).map(|id| id.traceparent());

        Self { trace_id, traceparent, ..Self::default() }
    }

    /// Copy of these headers with the retry count incremented.
    pub fn incremented(&self) -> Self {
        Self { retry_count: self.retry_count + 1, ..self.clone() }
    }

    /// Copy of these headers annotated for the dead-letter exchange.
    pub fn dead_lettered(&self, original_error: &str, stage: &str) -> Self {
        Self {
            original_error: Some(original_error.to_string()),
            failed_stage: Some(stage.to_string()),
            ..self.clone()
        }
    }
}

/// Acknowledgement handle for a single delivery.
///
/// Exactly one of the three operations must eventually be invoked for
/// every delivery; the consumer runtime guarantees this even when a
/// handler panics.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledges the delivery; the broker discards it.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Redelivers to this queue only, with the caller's (incremented)
    /// headers, then acknowledges the original.
    ///
    /// AMQP's native nack-requeue does not touch headers, so retry
    /// accounting is done by republishing through the default exchange.
    async fn requeue_with_retry(
        &self,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError>;

    /// Routes the original body to the dead-letter exchange with the error
    /// annotation, then acknowledges the original.
    async fn dead_letter(
        &self,
        body: &[u8],
        original_error: &str,
        headers: &MessageHeaders,
    ) -> Result<(), BrokerError>;
}

/// One message delivered from a queue.
pub struct Delivery {
    /// Routing key the message was published with.
    pub routing_key: String,

    /// Queue this delivery came from.
    pub queue: String,

    /// Raw message body.
    pub body: Vec<u8>,

    /// Parsed well-known headers.
    pub headers: MessageHeaders,

    /// Acknowledgement handle for this delivery.
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_trace_synthesises_traceparent_for_canonical_ids() {
        let headers =
            MessageHeaders::with_trace(Some("0af7651916cd43dd8448eb211c80319c".to_string()));

        assert!(headers.traceparent.is_some());
        assert!(headers
            .traceparent
            .unwrap()
            .contains("0af7651916cd43dd8448eb211c80319c"));
    }

    #[test]
    fn with_trace_skips_traceparent_for_foreign_ids() {
        let headers = MessageHeaders::with_trace(Some("abc".to_string()));
        assert_eq!(headers.trace_id.as_deref(), Some("abc"));
        assert!(headers.traceparent.is_none());
    }

    #[test]
    fn incremented_bumps_only_retry_count() {
        let headers = MessageHeaders::with_trace(Some("abc".to_string()));
        let next = headers.incremented();

        assert_eq!(next.retry_count, 1);
        assert_eq!(next.trace_id, headers.trace_id);
        assert_eq!(next.incremented().retry_count, 2);
    }

    #[test]
    fn dead_lettered_annotates_error_and_stage() {
        let headers = MessageHeaders::new().dead_lettered("json_unmarshal_error: eof", "worker");

        assert_eq!(headers.original_error.as_deref(), Some("json_unmarshal_error: eof"));
        assert_eq!(headers.failed_stage.as_deref(), Some("worker"));
    }
}
