//! Reconnect manager — bounded retry with exponential back-off.
//!
//! Attempt `k` (0-based) that fails is followed by a sleep of
//! `base_delay * 2^k` before attempt `k + 1`. The final failure returns
//! immediately with [`RetryExhausted`]. Sleeping uses `tokio::time::sleep`,
//! so other tasks on the runtime keep running during back-off.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 6;
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_RECONNECT_BASE,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Back-off after failed attempt `attempt` (0-based): `base_delay * 2^attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Attempts actually made by [`retry`].
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Every attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op(attempt)` until it succeeds or the policy's attempts are used up.
///
/// # Errors
///
/// [`RetryExhausted`] carrying the last attempt's error.
pub async fn retry<T, E, F, Fut>(policy: &ReconnectPolicy, mut op: F) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let total = policy.attempts();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt = attempt + 1, total, "reconnect: succeeded");
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 < total => {
                let delay = policy.delay_for(attempt);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    total,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnect: attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(error = %e, total, "reconnect: attempts exhausted");
                return Err(RetryExhausted {
                    attempts: total,
                    last_error: e,
                });
            }
        }
    }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
