//! Bounded restart policy for supervised sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::{ErrorAnalysis, ErrorCategory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Restart ceiling for every retryable category.
    pub max_restarts: u32,
    /// Lower ceiling for connection, timeout and TLS failures.
    pub network_max_restarts: u32,
    /// Flat delay for ordinary failures and the first network retry.
    pub base_delay_ms: u64,
    /// Cap of the exponential network backoff.
    pub max_delay_ms: u64,
    /// Flat delay for server-side and TLS failures.
    pub server_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            network_max_restarts: 2,
            base_delay_ms: 5_000,
            max_delay_ms: 30_000,
            server_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// Delay before restart number `attempt` (1-indexed).
    pub fn backoff(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match category {
            ErrorCategory::ServerError | ErrorCategory::Tls => self.server_delay_ms,
            c if c.is_network() => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms
                    .saturating_mul(factor)
                    .min(self.max_delay_ms)
            }
            _ => self.base_delay_ms,
        };
        Duration::from_millis(millis)
    }

    pub fn limit_for(&self, category: ErrorCategory) -> u32 {
        if category.is_network() {
            self.network_max_restarts.min(self.max_restarts)
        } else {
            self.max_restarts
        }
    }

    /// `restart_count` is the number of restarts already performed for the
    /// session since it was started.
    pub fn decide(&self, analysis: &ErrorAnalysis, restart_count: u32) -> RetryDecision {
        if !analysis.retryable || restart_count >= self.limit_for(analysis.category) {
            return RetryDecision::GiveUp;
        }

        let attempt = restart_count + 1;
        RetryDecision::Retry {
            attempt,
            delay: self.backoff(analysis.category, attempt),
        }
    }
}
