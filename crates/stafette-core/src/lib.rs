//! Core domain models and contracts for the Stafette event backbone.
//!
//! Provides the outbox event model, strongly-typed identifiers, the error
//! taxonomy with retryability classification, the wire contracts shared by
//! every service on the bus, and trace-identifier plumbing. All other
//! crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod contracts;
pub mod error;
pub mod models;
pub mod time;
pub mod trace;

pub use classify::{classify, Classified, ErrorClass};
pub use error::{Cancelled, CircuitOpen, CoreError, Result};
pub use models::{EventId, EventStatus, NewEvent, OutboxEvent};
pub use time::Clock;
pub use trace::TraceId;
