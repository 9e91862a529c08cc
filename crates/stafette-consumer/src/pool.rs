//! Supervised set of consumer runtimes for one process.
//!
//! A subscriber service typically listens on several queues. The set owns
//! one [`ConsumerRuntime`] per subscription, spawns them together, and
//! shuts them down collectively: stop intake everywhere, let in-flight
//! handlers finish, and bound the whole drain with a timeout.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    dedup::Deduper,
    handler::EventHandler,
    runtime::{spawn, ConsumerConfig, ConsumerRuntime},
};
use stafette_broker::{Broker, BrokerError};

/// Graceful shutdown exceeded its deadline; consumers may still be
/// draining.
#[derive(Debug, Error)]
#[error("consumer shutdown timed out after {timeout:?}")]
pub struct ShutdownTimeout {
    /// The deadline that was exceeded.
    pub timeout: Duration,
}

/// Collection of consumer runtimes sharing one broker connection.
pub struct ConsumerSet {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    runtimes: Vec<Arc<ConsumerRuntime>>,
    handles: Vec<JoinHandle<Result<(), BrokerError>>>,
}

impl ConsumerSet {
    /// Creates an empty set.
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self { broker, config, runtimes: Vec::new(), handles: Vec::new() }
    }

    /// Registers a handler for `routing_key` on its own queue.
    ///
    /// The runtime starts consuming when [`ConsumerSet::start_all`] runs.
    pub fn subscribe(
        &mut self,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        deduper: Option<Arc<Deduper>>,
    ) -> Arc<ConsumerRuntime> {
        let runtime = Arc::new(ConsumerRuntime::new(
            self.broker.clone(),
            queue,
            routing_key,
            handler,
            deduper,
            self.config.clone(),
        ));
        self.runtimes.push(runtime.clone());
        runtime
    }

    /// Spawns every subscription that is not already running.
    pub fn start_all(&mut self) {
        let pending = self.runtimes[self.handles.len()..].to_vec();
        for runtime in pending {
            self.handles.push(spawn(runtime));
        }

        info!(consumer_count = self.handles.len(), "consumer set started");
    }

    /// True while any consumer task is still running.
    pub fn has_active_consumers(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Stops every consumer and waits for their in-flight work, bounded by
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// [`ShutdownTimeout`] when draining exceeds the deadline; remaining
    /// tasks keep their cancellation signal and exit on their own.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        info!(
            consumer_count = self.runtimes.len(),
            timeout_secs = timeout.as_secs(),
            "stopping consumer set"
        );

        let drain = async {
            for runtime in &self.runtimes {
                runtime.stop().await;
            }

            for handle in self.handles.drain(..) {
                match handle.await {
                    Ok(Err(e)) => warn!(error = %e, "consumer ended with error during shutdown"),
                    Err(join_err) => {
                        error!(error = %join_err, "consumer task panicked during shutdown");
                    },
                    Ok(Ok(())) => {},
                }
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("consumer set shutdown complete");
                Ok(())
            },
            Err(_) => {
                error!(timeout_secs = timeout.as_secs(), "consumer set shutdown timed out");
                Err(ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for ConsumerSet {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 {
            warn!(
                active_consumers = active,
                "consumer set dropped while consumers were active, signalling stop"
            );
            for runtime in &self.runtimes {
                runtime.signal_stop();
            }
        }
    }
}
