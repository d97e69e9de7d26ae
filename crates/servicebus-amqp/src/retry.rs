//! Bounded retry with fixed delay for transient failures.
//!
//! Retry counts and intervals are plain values on [`RetryPolicy`], grouped per
//! call site in [`RetryConfig`], so every retrying operation receives its policy
//! explicitly.

use crate::context::OperationContext;
use crate::error::ServiceBusError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,

    /// Delay between attempts in milliseconds
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Single attempt, no delay
    pub fn none() -> Self {
        Self {
            attempts: 1,
            interval_ms: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Check if another attempt may follow attempt number `attempt` (0-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.attempts.max(1)
    }
}

/// Retry policies for each retrying call site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Claims negotiation on the `$cbs` link
    pub claims: RetryPolicy,

    /// Lock renewal RPCs
    pub lock_renewal: RetryPolicy,

    /// Peek, disposition, scheduling and deferred receive RPCs
    pub management: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            claims: RetryPolicy::new(3, Duration::from_secs(1)),
            lock_renewal: RetryPolicy::new(3, Duration::from_secs(1)),
            management: RetryPolicy::new(5, Duration::from_secs(5)),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are used up.
///
/// The closure receives the 0-based attempt number. The last error is
/// returned once attempts run out; cancellation of `ctx` ends the loop with
/// [`ServiceBusError::Cancelled`].
pub async fn retry<T, F, Fut>(
    ctx: &OperationContext,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ServiceBusError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceBusError>>,
{
    let mut attempt = 0;
    loop {
        ctx.check()?;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && policy.should_retry(attempt) => {
                debug!(
                    attempt = attempt + 1,
                    max_attempts = policy.attempts,
                    error = %error,
                    "Retryable failure, retrying after delay"
                );
                ctx.sleep(policy.interval()).await?;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
