//! Fixed-count retry policy.

use serde::{Deserialize, Serialize};

use crate::HttpPoolError;

/// Automatic retry configuration.
///
/// Retries happen immediately, on a fresh connection, and only for failures
/// that occurred before any request bytes were written. A request that was
/// partially transmitted is never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Whether automatic retry is enabled at all.
    pub enabled: bool,
    /// Maximum number of retries after the first attempt.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// No automatic retry.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Retry up to `max_attempts` times after the first attempt.
    pub fn fixed(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts,
        }
    }

    /// Upper bound on attempts for a single request, first attempt included.
    pub fn total_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.saturating_add(1)
        } else {
            1
        }
    }

    /// Check if another attempt should follow `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32, error: &HttpPoolError) -> bool {
        self.enabled && retries_done < self.max_attempts && error.is_retryable()
    }
}
