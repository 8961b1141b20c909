//! Builder configuration.

use std::time::Duration;

/// Retry policy for storage gateway calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Configuration for an [`EpochBuilder`](crate::EpochBuilder).
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderConfig {
    /// Retry policy for every gateway call.
    pub retry: RetryPolicy,
    /// Deadline for a single gateway call.
    pub storage_deadline: Duration,
    /// Period of the background sealer.
    pub seal_interval: Duration,
    /// Number of sealed index snapshots kept in memory.
    pub retained_epochs: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            storage_deadline: Duration::from_secs(5),
            seal_interval: Duration::from_secs(60),
            retained_epochs: 16,
        }
    }
}
