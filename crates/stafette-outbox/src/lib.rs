//! Transactional outbox for the Stafette event backbone.
//!
//! Producers append events inside their own business transaction; the
//! dispatcher drains committed events to the broker with retry and
//! backoff; the replay service resurrects events whose retries were
//! exhausted. Together they give exactly-once *effective* delivery:
//! at-least-once on the wire, deduplicated by idempotent consumers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod dispatcher;
pub mod replay;
pub mod store;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use replay::{ReplayError, ReplayService, ReplaySummary};
pub use store::{OutboxStore, PgOutboxStore};
