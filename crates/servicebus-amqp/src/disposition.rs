//! Settlement of messages by lock token over the management node.

use crate::context::OperationContext;
use crate::error::{BatchDispositionErrors, ServiceBusError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "disposition_tests.rs"]
mod tests;

/// Terminal outcome applied to a locked message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionStatus {
    Completed,
    Abandoned,
    /// Moves the message to the dead-letter sub-queue
    Suspended,
    Deferred,
}

impl DispositionStatus {
    /// Value of `disposition-status` on the wire. The service expects the
    /// deferred state spelled `defered`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Suspended => "suspended",
            Self::Deferred => "defered",
        }
    }
}

impl fmt::Display for DispositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disposition request for one or more lock tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub status: DispositionStatus,
    pub lock_tokens: Vec<Uuid>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl Disposition {
    pub fn new(status: DispositionStatus, lock_tokens: Vec<Uuid>) -> Self {
        Self {
            status,
            lock_tokens,
            dead_letter_reason: None,
            dead_letter_description: None,
        }
    }

    /// Dead-letter with an optional reason and description
    pub fn dead_letter(
        lock_tokens: Vec<Uuid>,
        reason: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            status: DispositionStatus::Suspended,
            lock_tokens,
            dead_letter_reason: reason,
            dead_letter_description: description,
        }
    }
}

/// Sends dispositions for locked messages
#[async_trait]
pub trait DispositionSender: Send + Sync {
    async fn send_disposition(
        &self,
        ctx: &OperationContext,
        disposition: Disposition,
    ) -> Result<(), ServiceBusError>;
}

/// Applies one status to a list of lock tokens, one request per token.
///
/// Every token is attempted. Failures do not stop the pass; they are
/// collected per token.
#[derive(Debug, Clone)]
pub struct BatchDispositionIterator {
    lock_tokens: Vec<Uuid>,
    status: DispositionStatus,
    cursor: usize,
}

impl BatchDispositionIterator {
    pub fn new(lock_tokens: Vec<Uuid>, status: DispositionStatus) -> Self {
        Self {
            lock_tokens,
            status,
            cursor: 0,
        }
    }

    pub fn status(&self) -> DispositionStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.lock_tokens.len()
    }

    /// Next lock token, advancing the cursor
    pub fn next(&mut self) -> Option<Uuid> {
        let token = self.lock_tokens.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(token)
    }

    /// Send the disposition for every remaining token.
    ///
    /// Only completed and abandoned are supported in bulk; any other status
    /// is recorded as [`ServiceBusError::UnsupportedDispositionStatus`] for
    /// each token.
    pub async fn do_update(
        &mut self,
        ctx: &OperationContext,
        sender: &dyn DispositionSender,
    ) -> Result<(), BatchDispositionErrors> {
        let mut errors = BatchDispositionErrors::new();

        while let Some(lock_token) = self.next() {
            let result = match self.status {
                DispositionStatus::Completed | DispositionStatus::Abandoned => {
                    sender
                        .send_disposition(ctx, Disposition::new(self.status, vec![lock_token]))
                        .await
                }
                other => Err(ServiceBusError::UnsupportedDispositionStatus {
                    status: other.to_string(),
                }),
            };

            match result {
                Ok(()) => debug!(%lock_token, status = %self.status, "Disposition sent"),
                Err(e) => {
                    warn!(%lock_token, status = %self.status, error = %e, "Disposition failed");
                    errors.insert(lock_token, e);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
