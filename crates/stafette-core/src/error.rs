//! Error types and result handling for the event backbone.
//!
//! Defines the shared error taxonomy used across the outbox, broker, and
//! consumer pipeline. Database errors are mapped into the taxonomy so that
//! callers can distinguish missing rows and constraint violations from
//! infrastructure failure.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Marker error raised when a guarded upstream call is short-circuited.
///
/// The circuit breaker surfaces this instead of invoking the protected
/// call while the circuit is open. Classified as retryable: the upstream
/// is expected to recover before the delivery's retry ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpen;

/// Marker error for work interrupted by context cancellation.
///
/// Handlers racing their context's cancellation token return this when
/// the token fires mid-wait. Classified as terminal: a delivery abandoned
/// because the process is going away must not be redelivered into the
/// same shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;
