// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded retry with exponential backoff for failed downloads.
//!
//! A failed task is retried until it has been attempted `max_attempts` times.
//! The wait before attempt `n + 1` is `base_delay * 2^(n - 1)`, capped at
//! [`MAX_DELAY`]. Failures that cannot succeed on a retry (most 4xx
//! responses) end the task right away.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// Default maximum attempts per item, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in seconds
const DEFAULT_BASE_DELAY_SECS: u64 = 30;

/// Upper bound for a single backoff
pub const MAX_DELAY: Duration = Duration::from_secs(600);

/// Retry settings, stored as part of the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_SECS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY_SECS,
        }
    }
}

/// What to do with a task whose attempt just failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the item back at the end of the queue after `delay`
    Retry { delay: Duration },
    /// Record a terminal failure
    GiveUp { reason: String },
}

impl RetryPolicy {
    /// Policy without backoff, mostly useful in tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: 0,
        }
    }

    /// Decide on a retry after `attempt` (1-indexed) failed with `error`
    pub fn decide(&self, error: &DownloadError, attempt: u32) -> RetryDecision {
        if is_permanent(error) {
            return RetryDecision::GiveUp {
                reason: "permanent failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    /// Backoff after the given failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let secs = self.base_delay.saturating_mul(1u64 << exponent);
        Duration::from_secs(secs).min(MAX_DELAY)
    }
}

fn is_permanent(error: &DownloadError) -> bool {
    match error {
        DownloadError::HttpStatus { status, .. } => {
            (400..500).contains(status) && !matches!(status, 408 | 429)
        }
        DownloadError::OutputUnknown { .. } => true,
        _ => false,
    }
}
