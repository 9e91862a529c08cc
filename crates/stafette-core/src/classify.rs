//! Error classification for the consumer pipeline.
//!
//! Handlers return opaque errors; the runtime asks this module whether a
//! failure deserves redelivery. Classification walks the error chain and
//! matches the concrete failure types used across the backbone.
//!
//! The rules:
//! - retryable: network timeouts and resets, upstream 5xx and rate limits,
//!   database connection failures, elapsed deadlines, open circuits;
//! - terminal: JSON decode failures, missing rows, upstream 4xx, invalid
//!   input, cancelled contexts, and anything unknown (conservative);
//! - already applied: unique-constraint violations. A duplicate write means
//!   an earlier delivery completed the side effect, so the delivery is
//!   acknowledged without dead-lettering.

use crate::error::{Cancelled, CircuitOpen, CoreError};

/// How the runtime should treat a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure; redeliver until the retry ceiling.
    Retryable,

    /// Permanent failure; dead-letter and acknowledge.
    Terminal,

    /// The side effect already happened; acknowledge and move on.
    AlreadyApplied,
}

/// Classification result with a stable label for logs and DLQ headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    /// Retry disposition.
    pub class: ErrorClass,

    /// Stable machine-readable failure label.
    pub label: &'static str,
}

impl Classified {
    const fn new(class: ErrorClass, label: &'static str) -> Self {
        Self { class, label }
    }

    /// True when the runtime should schedule a redelivery.
    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

/// Classifies a handler error by walking its source chain.
///
/// The first recognized cause wins; an unrecognized chain is terminal.
pub fn classify(err: &anyhow::Error) -> Classified {
    use ErrorClass::{AlreadyApplied, Retryable, Terminal};

    for cause in err.chain() {
        if cause.downcast_ref::<CircuitOpen>().is_some() {
            return Classified::new(Retryable, "circuit_open");
        }

        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return Classified::new(Terminal, "json_unmarshal_error");
        }

        if let Some(sql_err) = cause.downcast_ref::<sqlx::Error>() {
            return match sql_err {
                sqlx::Error::RowNotFound => Classified::new(Terminal, "not_found"),
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Classified::new(AlreadyApplied, "duplicate_key")
                },
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => {
                    Classified::new(Retryable, "db_connection_error")
                },
                _ => Classified::new(Terminal, "database_error"),
            };
        }

        if let Some(core_err) = cause.downcast_ref::<CoreError>() {
            return match core_err {
                CoreError::Database(_) => Classified::new(Retryable, "db_connection_error"),
                CoreError::NotFound(_) => Classified::new(Terminal, "not_found"),
                CoreError::ConstraintViolation(_) => {
                    Classified::new(AlreadyApplied, "duplicate_key")
                },
                CoreError::InvalidInput(_) => Classified::new(Terminal, "invalid_input"),
            };
        }

        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            if http_err.is_timeout() {
                return Classified::new(Retryable, "network_timeout");
            }
            if let Some(status) = http_err.status() {
                if status.as_u16() == 429 {
                    return Classified::new(Retryable, "rate_limited");
                }
                if status.is_server_error() {
                    return Classified::new(Retryable, "upstream_server_error");
                }
                if status.is_client_error() {
                    return Classified::new(Terminal, "upstream_client_error");
                }
            }
            return Classified::new(Retryable, "network_error");
        }

        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Classified::new(Retryable, "timeout");
        }

        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    Classified::new(Retryable, "network_timeout")
                },
                _ => Classified::new(Retryable, "network_error"),
            };
        }

        // A handler that lost the race against its context's cancellation
        // token; the delivery must not be redelivered into the shutdown.
        if cause.downcast_ref::<Cancelled>().is_some() {
            return Classified::new(Terminal, "context_canceled");
        }
    }

    Classified::new(ErrorClass::Terminal, "unknown_error")
}
