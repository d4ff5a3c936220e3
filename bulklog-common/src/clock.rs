//! Clock abstraction for time-driven engine loops.
//!
//! All wall-clock decisions in the engine (flush cadence, retry deadlines,
//! retention expiry) go through [`Clock`] so they can be controlled in tests.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock reading the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored to the tokio timer.
///
/// Under a paused runtime (`#[tokio::test(start_paused = true)]`) the
/// returned time advances in lockstep with `tokio::time::advance`, which
/// keeps wall-clock comparisons consistent with timer wakeups. Under a
/// normal runtime it tracks real time from the moment of construction.
pub struct TokioClock {
    epoch_wall: DateTime<Utc>,
    epoch_instant: tokio::time::Instant,
}

impl TokioClock {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            epoch_wall: Utc::now(),
            epoch_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.epoch_instant.elapsed();
        self.epoch_wall + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug)]
pub struct MockClock {
    now: RwLock<DateTime<Utc>>,
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap()
    }
}

impl MockClock {
    pub fn with_time(time: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap();
        *now = *now + TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.now.write().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_advance_mock_clock() {
        // given
        let clock = MockClock::new();
        let before = clock.now();

        // when
        clock.advance(Duration::from_secs(5));

        // then
        assert_eq!(clock.now() - before, TimeDelta::seconds(5));
    }

    #[tokio::test(start_paused = true)]
    async fn should_follow_tokio_time_when_paused() {
        // given
        let clock = TokioClock::new();
        let before = clock.now();

        // when
        tokio::time::advance(Duration::from_millis(1500)).await;

        // then
        assert_eq!(clock.now() - before, TimeDelta::milliseconds(1500));
    }
}
