//! Admin HTTP surface and configuration for the Stafette event backbone.
//!
//! Exposes the operator-facing replay endpoints and the readiness probe
//! that deployment orchestration watches. Everything runs against the
//! [`stafette_outbox::OutboxStore`] and [`stafette_broker::Broker`]
//! traits, so the router is testable with the in-memory doubles.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use stafette_broker::Broker;
use stafette_outbox::{OutboxStore, ReplayService};

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state behind every admin route.
#[derive(Clone)]
pub struct AppState {
    /// Outbox storage, also used for the readiness database ping.
    pub outbox: Arc<dyn OutboxStore>,

    /// Broker connectivity for the readiness probe.
    pub broker: Arc<dyn Broker>,

    /// Replay operations.
    pub replay: Arc<ReplayService>,
}

impl AppState {
    /// Builds the admin state over the backbone's shared components.
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        dispatcher_max_retries: u32,
    ) -> Self {
        let replay =
            Arc::new(ReplayService::new(outbox.clone(), broker.clone(), dispatcher_max_retries));
        Self { outbox, broker, replay }
    }
}
