//! Lazily attached links owned by entity facades.
//!
//! A [`LinkSlot`] holds at most one link, builds it on first use and refuses
//! to build once it has been closed. The closed flag is checked again under
//! the slot lock, so a link built concurrently with [`LinkSlot::close`] is
//! either handed to the closer or never stored.

use crate::context::OperationContext;
use crate::error::ServiceBusError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[cfg(test)]
#[path = "slot_tests.rs"]
mod tests;

pub(crate) struct LinkSlot<T> {
    entity_path: String,
    link: Mutex<Option<Arc<T>>>,
    closed: AtomicBool,
}

impl<T> LinkSlot<T> {
    pub(crate) fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ServiceBusError> {
        if self.is_closed() {
            return Err(ServiceBusError::LinkClosed {
                entity_path: self.entity_path.clone(),
            });
        }
        Ok(())
    }

    /// The stored link, or one built by `open` and stored
    pub(crate) async fn get_or_open<F, Fut>(
        &self,
        ctx: &OperationContext,
        open: F,
    ) -> Result<Arc<T>, ServiceBusError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceBusError>>,
    {
        self.ensure_open()?;
        let mut slot = ctx.run(async { Ok(self.link.lock().await) }).await?;
        // close() may have run while we waited for the lock
        self.ensure_open()?;

        if let Some(link) = slot.as_ref() {
            return Ok(Arc::clone(link));
        }
        let link = Arc::new(open().await?);
        *slot = Some(Arc::clone(&link));
        Ok(link)
    }

    /// Mark the slot closed and hand over the stored link, if any
    pub(crate) async fn close(&self) -> Option<Arc<T>> {
        self.closed.store(true, Ordering::Release);
        self.link.lock().await.take()
    }
}
