//! Messaging session wrapper.
//!
//! Each Sender or Receiver owns one transport session for the lifetime of its
//! link. The wrapper adds a group id and a sequence counter so outgoing
//! messages can be stamped for ordered delivery within the group.

use crate::error::TransportError;
use crate::transport::AmqpSession;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

/// Transport session plus group id and group sequence counter
pub struct Session {
    session: Box<dyn AmqpSession>,
    group_id: String,
    counter: AtomicU32,
}

impl Session {
    /// Wrap a transport session under a fresh group id
    pub fn new(session: Box<dyn AmqpSession>) -> Self {
        Self::with_group_id(session, Uuid::new_v4().to_string())
    }

    pub fn with_group_id(session: Box<dyn AmqpSession>, group_id: impl Into<String>) -> Self {
        Self {
            session,
            group_id: group_id.into(),
            counter: AtomicU32::new(0),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Next group sequence number; the first call returns 1
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Underlying transport session
    pub fn transport(&self) -> &dyn AmqpSession {
        self.session.as_ref()
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("group_id", &self.group_id)
            .field("counter", &self.counter.load(Ordering::Acquire))
            .finish()
    }
}
