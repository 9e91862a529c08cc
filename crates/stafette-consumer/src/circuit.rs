//! Circuit breaker for outbound calls made from handlers.
//!
//! Three states:
//!
//! ```text
//!            failure_threshold consecutive failures
//!  CLOSED ─────────────────────────────────────────▶ OPEN
//!    ▲                                                │
//!    │ success_threshold                              │ open_timeout
//!    │ consecutive successes                          ▼
//!    └─────────────────────────────────────────── HALF-OPEN
//!                       (any failure reopens; at most
//!                        half_open_max_requests probes in flight)
//! ```
//!
//! The lock is held only to read and update counters; the guarded call
//! itself runs with no lock held. One breaker instance guards one
//! upstream endpoint.

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{info, warn};

use stafette_core::{time::RealClock, CircuitOpen, Clock};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit from closed.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,

    /// Concurrent probe calls permitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
        }
    }
}

/// Current state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// All calls permitted.
    Closed,

    /// Calls short-circuit until the open timeout elapses.
    Open,

    /// Limited probe calls test whether the upstream recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E>
where
    E: fmt::Debug + fmt::Display,
{
    /// The breaker rejected the call without invoking it.
    #[error(transparent)]
    Open(#[from] CircuitOpen),

    /// The guarded call ran and failed with its own error.
    #[error("{0}")]
    Inner(E),
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

/// Three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a breaker named after the upstream it protects.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, Arc::new(RealClock))
    }

    /// Creates a breaker with an injected clock (deterministic tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    /// Runs `f` under breaker protection.
    ///
    /// Returns [`CircuitError::Open`] without invoking `f` while the
    /// circuit is open or the half-open probe budget is spent; otherwise
    /// returns `f`'s own result, recording it against the breaker state.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        self.try_acquire()?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            },
            Err(err) => {
                self.on_failure();
                Err(CircuitError::Inner(err))
            },
        }
    }

    /// Current state, via a read lock.
    pub fn state(&self) -> CircuitState {
        self.read().state
    }

    /// Resets the breaker to closed with clean counters.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
    }

    fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.write();

        // Open -> half-open once the timeout has elapsed.
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| self.clock.now().saturating_duration_since(at))
                .unwrap_or_default();

            if elapsed >= self.config.open_timeout {
                info!(breaker = %self.name, "circuit half-open, probing upstream");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
                inner.success_count = 0;
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(CircuitOpen),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    return Err(CircuitOpen);
                }
                inner.half_open_in_flight += 1;
                Ok(())
            },
        }
    }

    fn on_success(&self) {
        let mut inner = self.write();

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.success_count += 1;

                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit closed, upstream recovered");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                    inner.opened_at = None;
                }
            },
            // A success completing after the circuit reopened is stale.
            CircuitState::Open => {},
        }
    }

    fn on_failure(&self) {
        let mut inner = self.write();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(self.clock.now());
                }
            },
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                inner.half_open_in_flight = 0;
                inner.success_count = 0;
            },
            CircuitState::Open => {},
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BreakerState> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BreakerState> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        pin::Pin,
        sync::Mutex,
        time::SystemTime,
    };

    use super::*;

    /// Clock whose instant only moves when the test advances it.
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn now_system(&self) -> SystemTime {
            SystemTime::now()
        }

        fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(future::ready(()))
        }
    }

    use std::future::Future;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await.map(|_: ()| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls_through() {
        let breaker = CircuitBreaker::new("agent", test_config());

        assert_eq!(breaker.state(), CircuitState::Closed);
        let value = breaker.execute(|| async { Ok::<_, &'static str>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("agent", test_config());

        for _ in 0..2 {
            fail(&breaker).await.unwrap_err();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_invoking() {
        let breaker = CircuitBreaker::new("agent", test_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .execute(|| {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok::<_, &'static str>(()) }
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open(_))));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new("agent", test_config());

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        // Streak was broken, so still closed after four total failures.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_timeout_permits_probes_then_recovery_closes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock("agent", test_config(), clock.clone());

        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(31));

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_restarts_the_timer() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock("agent", test_config(), clock.clone());

        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        clock.advance(Duration::from_secs(31));

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        // The reopen restarted the timer, so probes stay blocked.
        clock.advance(Duration::from_secs(15));
        assert!(matches!(succeed(&breaker).await, Err(CircuitError::Open(_))));

        clock.advance(Duration::from_secs(16));
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let clock = ManualClock::new();
        let breaker = Arc::new(CircuitBreaker::with_clock("agent", test_config(), clock.clone()));

        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        clock.advance(Duration::from_secs(31));

        // Two probes may be in flight; hold them open on a channel.
        let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let breaker = breaker.clone();
            let mut release = release_tx.subscribe();
            probes.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release.recv().await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            }));
        }

        // Let both probes acquire their slots.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A third call is rejected while the budget is spent.
        assert!(matches!(succeed(&breaker).await, Err(CircuitError::Open(_))));

        release_tx.send(()).unwrap();
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_restores_a_clean_closed_state() {
        let breaker = CircuitBreaker::new("agent", test_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test]
    async fn open_error_converts_to_the_core_marker() {
        let breaker = CircuitBreaker::new("agent", test_config());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }

        match succeed(&breaker).await {
            Err(CircuitError::Open(open)) => {
                let err = anyhow::Error::new(open);
                assert!(stafette_core::classify(&err).is_retryable());
            },
            other => panic!("expected open circuit, got {other:?}"),
        }
    }
}
