//! Operator-driven replay of failed outbox events.
//!
//! Replay re-enters the pipeline at the broker's fan-out point, so every
//! subscriber reprocesses the event; consumer idempotence (dedup tokens,
//! conflict-tolerant writes) absorbs the repeats. When the broker itself
//! is down, `requeue_for_replay` on the store is the alternative, exposed
//! as the admin `requeue` endpoint: reset the event to pending and let
//! the dispatcher publish it once the broker recovers.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::{dispatcher::publish_event, store::OutboxStore};
use stafette_broker::{Broker, BrokerError};
use stafette_core::{CoreError, EventId};

/// Replay failure modes, mapped by the admin surface onto HTTP statuses.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Store lookup or update failed (includes unknown event ids).
    #[error(transparent)]
    Store(#[from] CoreError),

    /// The broker rejected the publish; the event was marked accordingly.
    #[error("replay publish failed: {0}")]
    Publish(#[from] BrokerError),
}

/// Outcome of a bulk replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReplaySummary {
    /// Events successfully republished.
    pub success_count: usize,

    /// The limit the operator asked for.
    pub limit: usize,
}

/// Operator-facing replay operations.
pub struct ReplayService {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    max_retries: u32,
}

impl ReplayService {
    /// Creates a replay service sharing the dispatcher's retry ceiling.
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, max_retries: u32) -> Self {
        Self { store, broker, max_retries }
    }

    /// Republishes one event and marks it sent.
    ///
    /// # Errors
    ///
    /// [`ReplayError::Store`] with [`CoreError::NotFound`] when the id is
    /// unknown; [`ReplayError::Publish`] when the broker refuses the
    /// message, in which case the failed attempt has been recorded.
    pub async fn replay_one(&self, id: EventId) -> Result<(), ReplayError> {
        let event = self.store.get(id).await?;

        if let Err(publish_err) = publish_event(self.broker.as_ref(), &event).await {
            let status = self.store.mark_failed_attempt(id, self.max_retries).await?;
            warn!(
                event_id = %id,
                status = %status,
                error = %publish_err,
                "replay publish failed"
            );
            return Err(publish_err.into());
        }

        self.store.mark_sent(id).await?;
        info!(event_id = %id, routing_key = %event.routing_key, "event replayed");
        Ok(())
    }

    /// Replays up to `limit` failed events, newest first.
    ///
    /// Individual failures are logged and skipped; the summary reports how
    /// many events made it back onto the bus.
    ///
    /// # Errors
    ///
    /// Only the initial `list_failed` lookup can fail the whole call.
    pub async fn replay_failed(&self, limit: usize) -> Result<ReplaySummary, CoreError> {
        let failed = self.store.list_failed(limit).await?;

        let mut success_count = 0;
        for event in failed {
            match self.replay_one(event.id).await {
                Ok(()) => success_count += 1,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping event during bulk replay");
                },
            }
        }

        info!(success_count, limit, "bulk replay finished");
        Ok(ReplaySummary { success_count, limit })
    }
}
