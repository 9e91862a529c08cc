//! Handler contract for queue subscribers.
//!
//! A handler is registered for one routing key by constructing a
//! [`crate::runtime::ConsumerRuntime`] over its queue. The runtime
//! decodes the message body to JSON before invocation, so handlers
//! receive a structurally valid document and deserialize it into their
//! typed payload; a decode failure inside the handler is classified
//! terminal and dead-letters the delivery like any other bad payload.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Per-delivery context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Trace identifier from the message headers, when present.
    pub trace_id: Option<String>,

    /// Consumer-level retry count of this delivery. Zero on first sight.
    pub retry_count: u32,

    /// Cancelled when the runtime is shutting down. Handlers doing slow
    /// upstream work should abort their waits when this fires and return
    /// [`stafette_core::Cancelled`], which the classifier maps to a
    /// terminal `context_canceled` outcome.
    pub cancel: CancellationToken,
}

/// A subscriber's message handler.
///
/// Handlers are expected to be idempotent: fan-out, redelivery, and
/// operator replay all cause repeats. The dedup token absorbs most of
/// them, but conflict-tolerant writes are the last line of defence.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Short stable name, used in dedup keys and logs.
    fn name(&self) -> &str;

    /// Extracts the entity identifier used for deduplication.
    ///
    /// Returning `None` disables the dedup gate for this delivery (the
    /// default for handlers with no single-entity identity).
    fn entity_id(&self, payload: &serde_json::Value) -> Option<i64> {
        let _ = payload;
        None
    }

    /// Processes one delivery.
    ///
    /// Errors are classified by [`stafette_core::classify`]: retryable
    /// failures are redelivered until the retry ceiling, terminal ones are
    /// dead-lettered, and already-applied ones are acknowledged.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}
