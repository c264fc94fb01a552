//! Clock abstraction for testable time-dependent components.
//!
//! The scheduler and the CoAP keep-alive loops both sleep and stamp
//! messages; injecting a clock lets tests drive them without real delays.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Time source used by every component that sleeps or stamps timestamps.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as nanoseconds since the Unix epoch, the `created`
    /// representation carried by messages.
    fn now_nanos(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// Suspends the caller for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests: sleeps advance virtual time instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at the given instant.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += ChronoDuration::from_std(duration).expect("duration out of range");
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Let other tasks observe the new time before the caller resumes.
        tokio::task::yield_now().await;
    }
}
