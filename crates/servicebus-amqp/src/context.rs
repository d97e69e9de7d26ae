//! Cancellation and deadline scope for network-facing operations.
//!
//! Every operation that suspends on the transport takes an [`OperationContext`].
//! Cancelling the context, or letting its deadline pass, unblocks the operation
//! with [`ServiceBusError::Cancelled`] or [`ServiceBusError::DeadlineExceeded`].

use crate::error::ServiceBusError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

/// Cancellation token plus optional deadline
#[derive(Debug, Clone)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OperationContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context driven by an existing cancellation token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Child context whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };

        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context sharing the deadline of this one
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Current state of the context as an error, if it is no longer usable
    pub fn check(&self) -> Result<(), ServiceBusError> {
        if self.cancel.is_cancelled() {
            return Err(ServiceBusError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ServiceBusError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run a fallible future bounded by this context
    pub async fn run<F, T>(&self, future: F) -> Result<T, ServiceBusError>
    where
        F: Future<Output = Result<T, ServiceBusError>>,
    {
        self.check()?;

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(ServiceBusError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => {
                        Err(ServiceBusError::DeadlineExceeded)
                    }
                    result = future => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(ServiceBusError::Cancelled),
                    result = future => result,
                }
            }
        }
    }

    /// Sleep for `duration` unless the context ends first
    pub async fn sleep(&self, duration: Duration) -> Result<(), ServiceBusError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
