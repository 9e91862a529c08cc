//! Consumer pipeline for the Stafette event backbone.
//!
//! One [`runtime::ConsumerRuntime`] per subscribed queue drives the
//! delivery state machine: decode, dedup, invoke the registered handler
//! behind a panic shield, and settle every delivery exactly once — ack,
//! requeue with retry accounting, or dead-letter with a reason. The
//! [`circuit::CircuitBreaker`] guards flaky upstreams called from
//! handlers, and [`dedup`] provides the shared-state primitives that make
//! redeliveries cheap.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod dedup;
pub mod handler;
pub mod pool;
pub mod runtime;
pub mod upstream;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use dedup::{Deduper, MemoryTtlStore, RedisTtlStore, RetryCounter, TtlStore};
pub use handler::{EventHandler, HandlerContext};
pub use pool::{ConsumerSet, ShutdownTimeout};
pub use runtime::{ConsumerConfig, ConsumerRuntime, ConsumerStats};
pub use upstream::{UpstreamClient, UpstreamConfig};
