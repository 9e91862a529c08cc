//! Dedup tokens and retry counters over a shared TTL key-value store.
//!
//! Both primitives are keyed by `(handler, entity_id)` and live in an
//! external store so that concurrent consumers and redeliveries across
//! process restarts observe the same state. The dedup token fails open:
//! when the store is unreachable, processing twice beats dropping a
//! delivery.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{info, warn};

/// Key-value operations with TTL semantics.
#[async_trait]
pub trait TtlStore: Send + Sync + 'static {
    /// Atomic set-if-absent. True when the key was newly set.
    async fn set_once(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Increments a counter, arming the TTL on first increment. Returns
    /// the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

    /// Deletes a key.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Redis-backed TTL store.
///
/// `ConnectionManager` multiplexes one connection and reconnects on
/// failure; cloning it per call is the intended usage.
#[derive(Clone)]
pub struct RedisTtlStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisTtlStore {
    /// Connects to redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns the underlying redis error if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TtlStore for RedisTtlStore {
    async fn set_once(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(outcome.is_some())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;

        if count == 1 {
            let _: bool = conn.expire(key, i64::try_from(ttl.as_secs().max(1)).unwrap_or(1)).await?;
        }

        Ok(count)
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}

/// In-memory TTL store for tests and single-process deployments.
pub struct MemoryTtlStore {
    entries: Mutex<HashMap<String, Entry>>,
    outage: Mutex<bool>,
}

struct Entry {
    value: i64,
    expires_at: Instant,
}

impl Default for MemoryTtlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTtlStore {
    /// Empty store.
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), outage: Mutex::new(false) }
    }

    /// Simulates a store outage: every operation errors until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.outage.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = unavailable;
    }

    /// Current value of a live key.
    pub fn value(&self, key: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value)
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if *self.outage.lock().unwrap_or_else(std::sync::PoisonError::into_inner) {
            anyhow::bail!("ttl store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn set_once(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.check_available()?;

        let mut entries =
            self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry { value: 1, expires_at: now + ttl },
                );
                Ok(true)
            },
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        self.check_available()?;

        let mut entries =
            self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();

        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expires_at <= now {
                    e.value = 0;
                    e.expires_at = now + ttl;
                }
            })
            .or_insert(Entry { value: 0, expires_at: now + ttl });

        entry.value += 1;
        Ok(entry.value)
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.check_available()?;

        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// First-sight gate for `(handler, entity_id)` pairs.
pub struct Deduper {
    store: std::sync::Arc<dyn TtlStore>,
    ttl: Duration,
}

impl Deduper {
    /// Default token lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    /// Creates a deduper with the given token lifetime.
    pub fn new(store: std::sync::Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// True when this is the first sighting of the pair within the TTL
    /// window. Fails open on store errors.
    pub async fn acquire_once(&self, handler: &str, entity_id: i64) -> bool {
        let key = format!("dedup:{handler}:{entity_id}");

        match self.store.set_once(&key, self.ttl).await {
            Ok(first) => {
                if !first {
                    info!(handler, entity_id, dedup_key = %key, "duplicate event skipped");
                }
                first
            },
            Err(e) => {
                warn!(
                    handler,
                    entity_id,
                    error = %e,
                    "dedup store unavailable, allowing processing"
                );
                true
            },
        }
    }
}

/// Second-chance retry accounting for handlers with their own ceiling
/// (beyond broker redelivery), e.g. an AI upstream that falls through to
/// an "unknown" verdict after N tries.
pub struct RetryCounter {
    store: std::sync::Arc<dyn TtlStore>,
    ttl: Duration,
}

impl RetryCounter {
    /// Creates a counter whose keys expire `ttl` after first increment.
    pub fn new(store: std::sync::Arc<dyn TtlStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Increments and returns the attempt count for `key`.
    ///
    /// # Errors
    ///
    /// Surfaces store errors; callers typically treat a failed read as
    /// attempt zero.
    pub async fn increment_and_get(&self, key: &str) -> anyhow::Result<i64> {
        self.store.increment(key, self.ttl).await
    }

    /// Clears the counter after a successful attempt.
    pub async fn reset(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            warn!(key, error = %e, "failed to reset retry counter");
        }
    }
}

/// Canonical retry-counter key for a handler/entity pair.
pub fn retry_key(handler: &str, entity_id: i64) -> String {
    format!("retry:{handler}:{entity_id}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn first_acquisition_wins_then_duplicates_skip() {
        let store = Arc::new(MemoryTtlStore::new());
        let deduper = Deduper::new(store, Duration::from_secs(60));

        assert!(deduper.acquire_once("agent", 42).await);
        assert!(!deduper.acquire_once("agent", 42).await);

        // A different handler or entity is an independent pair.
        assert!(deduper.acquire_once("notify", 42).await);
        assert!(deduper.acquire_once("agent", 43).await);
    }

    #[tokio::test]
    async fn tokens_expire_after_the_ttl_window() {
        let store = Arc::new(MemoryTtlStore::new());
        let deduper = Deduper::new(store, Duration::from_millis(30));

        assert!(deduper.acquire_once("agent", 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deduper.acquire_once("agent", 1).await);
    }

    #[tokio::test]
    async fn dedup_fails_open_when_the_store_is_down() {
        let store = Arc::new(MemoryTtlStore::new());
        store.set_unavailable(true);

        let deduper = Deduper::new(store.clone(), Duration::from_secs(60));
        assert!(deduper.acquire_once("agent", 1).await);
        assert!(deduper.acquire_once("agent", 1).await);

        // Once the store recovers, dedup resumes.
        store.set_unavailable(false);
        assert!(deduper.acquire_once("agent", 1).await);
        assert!(!deduper.acquire_once("agent", 1).await);
    }

    #[tokio::test]
    async fn retry_counter_increments_and_resets() {
        let store = Arc::new(MemoryTtlStore::new());
        let counter = RetryCounter::new(store.clone(), Duration::from_secs(60));
        let key = retry_key("agent", 42);

        assert_eq!(counter.increment_and_get(&key).await.unwrap(), 1);
        assert_eq!(counter.increment_and_get(&key).await.unwrap(), 2);
        assert_eq!(store.value(&key), Some(2));

        counter.reset(&key).await;
        assert_eq!(counter.increment_and_get(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_counter_restarts_after_expiry() {
        let store = Arc::new(MemoryTtlStore::new());
        let counter = RetryCounter::new(store, Duration::from_millis(30));
        let key = retry_key("agent", 1);

        assert_eq!(counter.increment_and_get(&key).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.increment_and_get(&key).await.unwrap(), 1);
    }

    #[test]
    fn retry_keys_have_the_canonical_shape() {
        assert_eq!(retry_key("agent", 42), "retry:agent:42");
    }
}
