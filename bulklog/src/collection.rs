//! Collection descriptors: the per-stream delivery cadence.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on flush transaction retries.
pub const DEFAULT_MAX_TX_RETRIES: u32 = 8;

/// Retry back-off schedule for a pipe's consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Retry every flush period.
    #[default]
    Constant,
    /// Double the delay each round, capped at a quarter of the retention
    /// period.
    Exponential,
}

impl BackoffPolicy {
    /// Delay before the next delivery attempt after `iteration` failed
    /// rounds (`iteration >= 1`). Computed from the pipe's own periods so
    /// adopted pipes keep their sealed cadence.
    pub(crate) fn delay_for(
        &self,
        iteration: u32,
        flush_period: Duration,
        retention_period: Duration,
    ) -> Duration {
        match self {
            BackoffPolicy::Constant => flush_period,
            BackoffPolicy::Exponential => {
                let exponent = iteration.saturating_sub(1).min(20);
                let delay = flush_period.saturating_mul(1 << exponent);
                delay.min(retention_period / 4)
            }
        }
    }
}

/// A named stream of documents sharing a flush cadence, retention window
/// and consumer set.
///
/// The descriptor is copied into each pipe at seal time, so a pipe remains
/// self-describing even if the collection is later re-registered with
/// different settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Unique collection name; also the namespace for its store keys.
    pub name: String,
    /// Duration between flush decisions.
    pub flush_period: Duration,
    /// Maximum wall-clock lifetime of a pipe in retry.
    pub retention_period: Duration,
    /// Consumer retry schedule.
    pub backoff: BackoffPolicy,
    /// Bound on flush transaction retries before giving up the tick.
    pub max_tx_retries: u32,
}

impl Collection {
    /// Creates a collection descriptor, enforcing
    /// `0 < flush_period <= retention_period`.
    pub fn new(
        name: impl Into<String>,
        flush_period: Duration,
        retention_period: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidCollection(
                "collection name is empty".to_string(),
            ));
        }
        if flush_period.is_zero() || flush_period > retention_period {
            return Err(Error::InvalidCollection(name));
        }
        Ok(Self {
            name,
            flush_period,
            retention_period,
            backoff: BackoffPolicy::default(),
            max_tx_retries: DEFAULT_MAX_TX_RETRIES,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_tx_retries(mut self, max_tx_retries: u32) -> Self {
        self.max_tx_retries = max_tx_retries;
        self
    }

    pub(crate) fn flush_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.flush_period).unwrap_or(TimeDelta::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_accept_valid_periods() {
        // when
        let collection =
            Collection::new("audit", Duration::from_secs(1), Duration::from_secs(10)).unwrap();

        // then
        assert_eq!(collection.backoff, BackoffPolicy::Constant);
        assert_eq!(collection.max_tx_retries, DEFAULT_MAX_TX_RETRIES);
    }

    #[test]
    fn should_reject_zero_flush_period() {
        let result = Collection::new("audit", Duration::ZERO, Duration::from_secs(10));
        assert!(matches!(result, Err(Error::InvalidCollection(_))));
    }

    #[test]
    fn should_reject_flush_period_longer_than_retention() {
        let result = Collection::new("audit", Duration::from_secs(11), Duration::from_secs(10));
        assert!(matches!(result, Err(Error::InvalidCollection(_))));
    }

    #[test]
    fn should_reject_empty_name() {
        let result = Collection::new("", Duration::from_secs(1), Duration::from_secs(10));
        assert!(matches!(result, Err(Error::InvalidCollection(_))));
    }

    #[test]
    fn should_use_constant_backoff_by_default() {
        // given
        let flush = Duration::from_secs(2);
        let retention = Duration::from_secs(60);

        // then - every round waits one flush period
        assert_eq!(BackoffPolicy::Constant.delay_for(1, flush, retention), flush);
        assert_eq!(BackoffPolicy::Constant.delay_for(5, flush, retention), flush);
    }

    #[test]
    fn should_double_exponential_backoff_with_cap() {
        // given
        let flush = Duration::from_secs(1);
        let retention = Duration::from_secs(64);
        let policy = BackoffPolicy::Exponential;

        // then - 1s, 2s, 4s, 8s, then capped at retention/4 = 16s
        assert_eq!(policy.delay_for(1, flush, retention), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, flush, retention), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, flush, retention), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, flush, retention), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5, flush, retention), Duration::from_secs(16));
        assert_eq!(policy.delay_for(10, flush, retention), Duration::from_secs(16));
    }
}
