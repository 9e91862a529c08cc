//! Time abstraction for testable timing.
//!
//! The dispatcher tick, retry scheduling, and breaker timing all consult a
//! [`Clock`] so tests can run deterministically. Production code injects
//! [`RealClock`].

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    ///
    /// Production maps to `tokio::time::sleep`; test clocks may return
    /// immediately or advance virtual time.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        self.now_system().into()
    }
}

/// Real clock backed by system time and tokio's sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
