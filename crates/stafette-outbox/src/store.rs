//! Outbox storage: the transactional append and the dispatcher-facing
//! operations.
//!
//! `PgOutboxStore` is the production implementation. Appends go through
//! the caller's transaction so an event is visible exactly when the
//! business write it describes is. Everything the dispatcher, replay
//! service, and admin surface need is behind the [`OutboxStore`] trait so
//! they can be exercised against the in-memory mock without a database.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::backoff::BackoffPolicy;
use stafette_core::{
    time::RealClock, Clock, CoreError, EventId, EventStatus, NewEvent, OutboxEvent, Result,
};

const EVENT_COLUMNS: &str = "id, aggregate_type, aggregate_id, routing_key, payload, status, \
                             retry_count, next_retry_at, created_at, updated_at";

/// Operations on persisted outbox events.
///
/// Appending is deliberately *not* part of this trait: it requires the
/// caller's database transaction and therefore only exists on the
/// concrete [`PgOutboxStore`] (and on the mock for tests).
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Up to `limit` pending events whose retry time has arrived, oldest
    /// first.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Marks an event sent. Idempotent.
    async fn mark_sent(&self, id: EventId) -> Result<()>;

    /// Records a failed publish attempt.
    ///
    /// Increments the retry count; at or above `max_retries` the event
    /// becomes terminally failed, otherwise a retry is scheduled using the
    /// store's backoff policy. Returns the resulting status.
    async fn mark_failed_attempt(&self, id: EventId, max_retries: u32) -> Result<EventStatus>;

    /// Fetches one event.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] when no such event exists.
    async fn get(&self, id: EventId) -> Result<OutboxEvent>;

    /// Most recent terminally failed events.
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Resets a failed event to pending with a clean retry slate, so the
    /// dispatcher picks it up on its next tick.
    async fn requeue_for_replay(&self, id: EventId) -> Result<()>;

    /// Storage connectivity check for readiness probes.
    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL-backed outbox store.
pub struct PgOutboxStore {
    pool: PgPool,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl PgOutboxStore {
    /// Creates a store with the default backoff policy and real clock.
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, BackoffPolicy::default(), Arc::new(RealClock))
    }

    /// Creates a store with an explicit backoff policy and clock.
    pub fn with_policy(pool: PgPool, policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { pool, policy, clock }
    }

    /// Appends one event inside the caller's transaction.
    ///
    /// The insert becomes visible atomically with the caller's business
    /// writes on commit; this method never commits or rolls back itself.
    /// The returned row carries the assigned id and timestamps.
    ///
    /// # Errors
    ///
    /// Any insertion failure is returned so the caller can abort its
    /// transaction; no event then exists, and neither does the business
    /// write.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewEvent,
    ) -> Result<OutboxEvent> {
        let inserted = sqlx::query_as::<_, OutboxEvent>(
            "INSERT INTO outbox_events (aggregate_type, aggregate_id, routing_key, payload, status)
             VALUES ($1, $2, $3, $4, 'pending')
             RETURNING id, aggregate_type, aggregate_id, routing_key, payload, status,
                       retry_count, next_retry_at, created_at, updated_at",
        )
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.routing_key)
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await?;

        debug!(
            event_id = %inserted.id,
            routing_key = %inserted.routing_key,
            aggregate_type = %inserted.aggregate_type,
            "outbox event appended"
        );

        Ok(inserted)
    }

    /// Bootstraps the outbox schema.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error if DDL fails.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbox_events (
                id BIGSERIAL PRIMARY KEY,
                aggregate_type TEXT NOT NULL,
                aggregate_id BIGINT,
                routing_key TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
             ON outbox_events (created_at)
             WHERE status = 'pending'",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= $1)
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(self.clock.now_utc())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn mark_sent(&self, id: EventId) -> Result<()> {
        sqlx::query("UPDATE outbox_events SET status = 'sent', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_failed_attempt(&self, id: EventId, max_retries: u32) -> Result<EventStatus> {
        // Row lock so two racing dispatchers cannot double-count the
        // same failed attempt.
        let mut tx = self.pool.begin().await?;

        let retry_count: i32 =
            sqlx::query_scalar("SELECT retry_count FROM outbox_events WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("outbox event {id}")))?;

        let new_count = retry_count.saturating_add(1);
        let exhausted = u32::try_from(new_count).unwrap_or(u32::MAX) >= max_retries;

        let (status, next_retry_at) = if exhausted {
            (EventStatus::Failed, None)
        } else {
            let delay = self.policy.delay_for(u32::try_from(new_count).unwrap_or(1));
            let next = self.clock.now_utc()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            (EventStatus::Pending, Some(next))
        };

        sqlx::query(
            "UPDATE outbox_events
             SET status = $1, retry_count = $2, next_retry_at = $3, updated_at = NOW()
             WHERE id = $4",
        )
        .bind(status.to_string())
        .bind(new_count)
        .bind(next_retry_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(status)
    }

    async fn get(&self, id: EventId) -> Result<OutboxEvent> {
        sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("outbox event {id}")))
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events
             WHERE status = 'failed'
             ORDER BY created_at DESC
             LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn requeue_for_replay(&self, id: EventId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_events
             SET status = 'pending', retry_count = 0, next_retry_at = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("outbox event {id}")));
        }

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

pub mod mock {
    //! In-memory outbox store for tests.
    //!
    //! Mirrors the PostgreSQL store's observable behaviour: append order
    //! equals fetch order, retry scheduling follows the backoff policy,
    //! and terminal transitions match.

    use std::sync::Mutex;

    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;

    /// In-memory [`OutboxStore`].
    pub struct MemoryOutboxStore {
        state: Mutex<MemoryState>,
        policy: BackoffPolicy,
    }

    struct MemoryState {
        events: Vec<OutboxEvent>,
        next_id: i64,
        now_override: Option<DateTime<Utc>>,
        fail_fetches: u32,
    }

    impl Default for MemoryOutboxStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryOutboxStore {
        /// Empty store with the default backoff policy.
        pub fn new() -> Self {
            Self::with_policy(BackoffPolicy::default())
        }

        /// Empty store with an explicit backoff policy.
        pub fn with_policy(policy: BackoffPolicy) -> Self {
            Self {
                state: Mutex::new(MemoryState {
                    events: Vec::new(),
                    next_id: 1,
                    now_override: None,
                    fail_fetches: 0,
                }),
                policy,
            }
        }

        /// Appends a pending event, assigning id and timestamps.
        ///
        /// Stands in for `PgOutboxStore::append_in_tx`; the "transaction"
        /// of the mock is the single lock acquisition.
        pub fn append(&self, event: NewEvent) -> OutboxEvent {
            let mut state = self.lock();
            let now = state.now();

            // Strictly increasing created_at keeps fetch order stable even
            // when appends land within one clock tick.
            let created_at = now + ChronoDuration::microseconds(state.next_id);

            let stored = OutboxEvent {
                id: EventId(state.next_id),
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                routing_key: event.routing_key,
                payload: event.payload,
                status: EventStatus::Pending,
                retry_count: 0,
                next_retry_at: None,
                created_at,
                updated_at: created_at,
            };

            state.next_id += 1;
            state.events.push(stored.clone());
            stored
        }

        /// Current snapshot of one event.
        pub fn event(&self, id: EventId) -> Option<OutboxEvent> {
            self.lock().events.iter().find(|e| e.id == id).cloned()
        }

        /// Overrides "now" for due-time filtering.
        pub fn set_now(&self, now: DateTime<Utc>) {
            self.lock().now_override = Some(now);
        }

        /// Makes the next `count` fetches fail with a database error.
        pub fn inject_fetch_failures(&self, count: u32) {
            self.lock().fail_fetches = count;
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl MemoryState {
        fn now(&self) -> DateTime<Utc> {
            self.now_override.unwrap_or_else(Utc::now)
        }

        fn find_mut(&mut self, id: EventId) -> Result<&mut OutboxEvent> {
            self.events
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("outbox event {id}")))
        }
    }

    #[async_trait]
    impl OutboxStore for MemoryOutboxStore {
        async fn fetch_due(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
            let mut state = self.lock();

            if state.fail_fetches > 0 {
                state.fail_fetches -= 1;
                return Err(CoreError::Database("injected fetch failure".to_string()));
            }

            let now = state.now();
            let mut due: Vec<OutboxEvent> = state
                .events
                .iter()
                .filter(|e| {
                    e.status == EventStatus::Pending
                        && e.next_retry_at.map_or(true, |at| at <= now)
                })
                .cloned()
                .collect();

            due.sort_by_key(|e| (e.created_at, e.id));
            due.truncate(limit);
            Ok(due)
        }

        async fn mark_sent(&self, id: EventId) -> Result<()> {
            let mut state = self.lock();
            let now = state.now();
            let event = state.find_mut(id)?;
            event.status = EventStatus::Sent;
            event.updated_at = now;
            Ok(())
        }

        async fn mark_failed_attempt(&self, id: EventId, max_retries: u32) -> Result<EventStatus> {
            let mut state = self.lock();
            let now = state.now();

            // Compute before borrowing the event mutably.
            let new_count = state.find_mut(id)?.retry_count.saturating_add(1);
            let exhausted = u32::try_from(new_count).unwrap_or(u32::MAX) >= max_retries;
            let next_retry_at = if exhausted {
                None
            } else {
                let delay = self.policy.delay_for(u32::try_from(new_count).unwrap_or(1));
                Some(now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero()))
            };

            let event = state.find_mut(id)?;
            event.retry_count = new_count;
            event.next_retry_at = next_retry_at;
            event.status = if exhausted { EventStatus::Failed } else { EventStatus::Pending };
            event.updated_at = now;
            Ok(event.status)
        }

        async fn get(&self, id: EventId) -> Result<OutboxEvent> {
            self.event(id).ok_or_else(|| CoreError::NotFound(format!("outbox event {id}")))
        }

        async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
            let state = self.lock();
            let mut failed: Vec<OutboxEvent> = state
                .events
                .iter()
                .filter(|e| e.status == EventStatus::Failed)
                .cloned()
                .collect();

            failed.sort_by_key(|e| std::cmp::Reverse((e.created_at, e.id)));
            failed.truncate(limit);
            Ok(failed)
        }

        async fn requeue_for_replay(&self, id: EventId) -> Result<()> {
            let mut state = self.lock();
            let now = state.now();
            let event = state.find_mut(id)?;
            event.status = EventStatus::Pending;
            event.retry_count = 0;
            event.next_retry_at = None;
            event.updated_at = now;
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }
}
