//! Receiving from one messaging session.
//!
//! A [`SessionReceiver`] attaches a receiver link filtered to a single
//! session id. The entity grants the link a session lock: while the lock is
//! held no other link receives that session's messages. The lock expires
//! unless it is renewed over the entity's management node with
//! [`SessionReceiver::renew_lock`].

use crate::context::OperationContext;
use crate::entity::Entity;
use crate::error::ServiceBusError;
use crate::link::LinkHost;
use crate::receiver::{Handler, ListenerHandle, MessageReceiver, Receiver, ReceiverOptions};
use crate::transport::ReceiveMode;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

#[cfg(test)]
#[path = "session_receiver_tests.rs"]
mod tests;

/// Receiver holding the lock on one messaging session
pub struct SessionReceiver {
    session_id: String,
    receiver: Receiver,
    entity: Entity,
    locked_until: Mutex<Option<DateTime<Utc>>>,
}

impl SessionReceiver {
    /// Attach a receiver for `session_id` on the entity behind `entity`.
    ///
    /// Any session filter in `options` is replaced by `session_id`.
    #[instrument(skip(ctx, host, entity, options), fields(entity_path = %entity.name()))]
    pub async fn accept(
        ctx: &OperationContext,
        host: Arc<dyn LinkHost>,
        entity: Entity,
        session_id: &str,
        options: ReceiverOptions,
    ) -> Result<Self, ServiceBusError> {
        let session_id = session_id.to_string();
        let options = ReceiverOptions {
            session_filter: Some(session_id.clone()),
            ..options
        };
        let receiver = Receiver::new(ctx, host, entity.name(), options).await?;
        let locked_until = receiver.session_locked_until(ctx).await?;
        info!(session_id = %session_id, ?locked_until, "Session accepted");

        Ok(Self {
            session_id,
            receiver,
            entity,
            locked_until: Mutex::new(locked_until),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn entity_path(&self) -> &str {
        self.entity.name()
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.receiver.receive_mode()
    }

    /// Expiry of the session lock as last reported by the entity.
    ///
    /// `None` when the entity reported no lock, as in receive-and-delete mode.
    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        *self
            .locked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Extend the session lock, returning and recording its new expiry
    #[instrument(skip(self, ctx), fields(session_id = %self.session_id))]
    pub async fn renew_lock(
        &self,
        ctx: &OperationContext,
    ) -> Result<DateTime<Utc>, ServiceBusError> {
        let expiry = self
            .entity
            .renew_session_lock(ctx, &self.session_id)
            .await?;
        *self
            .locked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(expiry);
        debug!(locked_until = %expiry, "Session lock extended");
        Ok(expiry)
    }

    /// State stored with the session; `None` when unset
    pub async fn state(&self, ctx: &OperationContext) -> Result<Option<Bytes>, ServiceBusError> {
        self.entity.session_state(ctx, &self.session_id).await
    }

    pub async fn set_state(
        &self,
        ctx: &OperationContext,
        state: Bytes,
    ) -> Result<(), ServiceBusError> {
        self.entity
            .set_session_state(ctx, &self.session_id, state)
            .await
    }

    /// See [`Receiver::listen`]
    pub async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        self.receiver.listen(ctx, handler).await
    }

    pub async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        self.receiver.receive_one(ctx, handler).await
    }

    /// Close the link, giving up the session lock
    #[instrument(skip(self, ctx), fields(session_id = %self.session_id))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        self.receiver.close(ctx).await?;
        info!("Session released");
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for SessionReceiver {
    async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        SessionReceiver::listen(self, ctx, handler).await
    }

    async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        SessionReceiver::receive_one(self, ctx, handler).await
    }
}

impl std::fmt::Debug for SessionReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReceiver")
            .field("entity_path", &self.entity.name())
            .field("session_id", &self.session_id)
            .field("locked_until", &self.locked_until())
            .finish()
    }
}
