//! Error types for broker operations.

use thiserror::Error;

/// Failures surfaced by the broker adapter.
///
/// Connection and declaration failures are startup-fatal; publish and
/// consume failures are handed back to the caller, which owns the retry
/// decision.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Connection establishment or loss.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Exchange, queue, or binding declaration failed.
    #[error("broker declaration failed: {0}")]
    Declare(String),

    /// Publish was not accepted by the broker.
    #[error("broker publish failed: {0}")]
    Publish(String),

    /// Consume registration or delivery receipt failed.
    #[error("broker consume failed: {0}")]
    Consume(String),

    /// Acknowledgement could not be issued.
    #[error("broker acknowledgement failed: {0}")]
    Acknowledge(String),
}
