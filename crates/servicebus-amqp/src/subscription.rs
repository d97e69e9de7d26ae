//! Subscription facade over a lazily attached receiver and the subscription's
//! management node.
//!
//! A subscription is addressed as `<topic>/Subscriptions/<name>` and has its
//! own dead-letter sub-queues beneath that path.

use crate::config::ServiceBusConfig;
use crate::context::OperationContext;
use crate::entity::{dead_letter_path, transfer_dead_letter_path, Entity};
use crate::error::{BatchDispositionErrors, ServiceBusError};
use crate::link::LinkHost;
use crate::message::Message;
use crate::peek::{PeekIterator, PeekOptions};
use crate::queue::QueueOptions;
use crate::receiver::{Handler, ListenerHandle, MessageReceiver, Receiver, ReceiverOptions};
use crate::retry::RetryConfig;
use crate::session_receiver::SessionReceiver;
use crate::slot::LinkSlot;
use crate::transport::ReceiveMode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;

/// Per-subscription overrides of the namespace configuration
pub type SubscriptionOptions = QueueOptions;

/// A topic subscription with a lazily attached receiver
pub struct Subscription {
    entity_path: String,
    host: Arc<dyn LinkHost>,
    entity: Entity,
    receiver_options: ReceiverOptions,
    retry: RetryConfig,
    receiver: LinkSlot<Receiver>,
}

impl Subscription {
    /// Subscription at `entity_path`, usually built with [`crate::Topic::subscription`]
    pub fn new(
        host: Arc<dyn LinkHost>,
        entity_path: impl Into<String>,
        config: &ServiceBusConfig,
        options: SubscriptionOptions,
    ) -> Self {
        let entity_path = entity_path.into();
        let entity = Entity::new(entity_path.clone(), host.clone(), config.retry.clone())
            .with_default_page_size(config.peek_page_size);

        Self {
            entity,
            receiver_options: ReceiverOptions {
                receive_mode: options.receive_mode,
                prefetch: options.prefetch.unwrap_or(config.receiver_prefetch).max(1),
                session_filter: options.session_filter,
                claim_refresh_interval: config.claim_refresh_interval(),
            },
            retry: config.retry.clone(),
            receiver: LinkSlot::new(entity_path.clone()),
            host,
            entity_path,
        }
    }

    /// `<topic>/Subscriptions/<name>`
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Management operations on this subscription
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.receiver_options.receive_mode
    }

    async fn receiver(&self, ctx: &OperationContext) -> Result<Arc<Receiver>, ServiceBusError> {
        self.receiver
            .get_or_open(ctx, || {
                let options = self.receiver_options.clone();
                Receiver::new(ctx, self.host.clone(), &self.entity_path, options)
            })
            .await
    }

    /// Start dispatching messages to `handler`; see [`Receiver::listen`]
    pub async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        self.receiver(ctx).await?.listen(ctx, handler).await
    }

    /// Dispatch messages to `handler` until `ctx` ends or the link fails.
    ///
    /// Cancellation is a normal stop; a link failure is returned.
    #[instrument(skip(self, ctx, handler), fields(entity_path = %self.entity_path))]
    pub async fn receive(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ServiceBusError> {
        let handle = self.listen(ctx, handler).await?;
        handle.done().await;

        match handle.take_error() {
            Some(e) => Err(e),
            None => {
                debug!("Listener finished");
                Ok(())
            }
        }
    }

    /// Receive and settle one message; see [`Receiver::receive_one`]
    pub async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        self.receiver(ctx).await?.receive_one(ctx, handler).await
    }

    pub fn peek(&self, options: PeekOptions) -> Result<PeekIterator<'_>, ServiceBusError> {
        self.entity.peek(options)
    }

    pub async fn peek_one(
        &self,
        ctx: &OperationContext,
        options: PeekOptions,
    ) -> Result<Message, ServiceBusError> {
        self.entity.peek_one(ctx, options).await
    }

    pub async fn renew_locks(
        &self,
        ctx: &OperationContext,
        messages: &mut [Message],
    ) -> Result<(), ServiceBusError> {
        self.entity.renew_locks(ctx, messages).await
    }

    /// Settle `message` as completed over the management node
    pub async fn complete(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        self.entity.complete(ctx, message).await
    }

    pub async fn abandon(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        self.entity.abandon(ctx, message).await
    }

    pub async fn defer(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        self.entity.defer(ctx, message).await
    }

    /// Move `message` to the subscription's dead-letter sub-queue
    pub async fn dead_letter(
        &self,
        ctx: &OperationContext,
        message: &Message,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), ServiceBusError> {
        self.entity.dead_letter(ctx, message, reason, description).await
    }

    pub async fn complete_batch(
        &self,
        ctx: &OperationContext,
        lock_tokens: Vec<Uuid>,
    ) -> Result<(), BatchDispositionErrors> {
        self.entity.complete_batch(ctx, lock_tokens).await
    }

    pub async fn abandon_batch(
        &self,
        ctx: &OperationContext,
        lock_tokens: Vec<Uuid>,
    ) -> Result<(), BatchDispositionErrors> {
        self.entity.abandon_batch(ctx, lock_tokens).await
    }

    /// Receive deferred messages in this subscription's receive mode
    pub async fn receive_deferred(
        &self,
        ctx: &OperationContext,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, ServiceBusError> {
        self.entity
            .receive_deferred(ctx, self.receiver_options.receive_mode, sequence_numbers)
            .await
    }

    /// Receiver on the subscription's dead-letter sub-queue, owned by the caller
    pub async fn new_dead_letter_receiver(
        &self,
        ctx: &OperationContext,
    ) -> Result<Receiver, ServiceBusError> {
        self.sub_queue_receiver(ctx, dead_letter_path(&self.entity_path))
            .await
    }

    pub async fn new_transfer_dead_letter_receiver(
        &self,
        ctx: &OperationContext,
    ) -> Result<Receiver, ServiceBusError> {
        self.sub_queue_receiver(ctx, transfer_dead_letter_path(&self.entity_path))
            .await
    }

    async fn sub_queue_receiver(
        &self,
        ctx: &OperationContext,
        path: String,
    ) -> Result<Receiver, ServiceBusError> {
        let options = ReceiverOptions {
            session_filter: None,
            ..self.receiver_options.clone()
        };
        Receiver::new(ctx, self.host.clone(), &path, options).await
    }

    /// Lock messaging session `session_id` on this subscription
    pub async fn accept_session(
        &self,
        ctx: &OperationContext,
        session_id: &str,
    ) -> Result<SessionReceiver, ServiceBusError> {
        if self.receiver.is_closed() {
            return Err(ServiceBusError::LinkClosed {
                entity_path: self.entity_path.clone(),
            });
        }
        let entity = Entity::new(self.entity_path.clone(), self.host.clone(), self.retry.clone());
        SessionReceiver::accept(
            ctx,
            self.host.clone(),
            entity,
            session_id,
            self.receiver_options.clone(),
        )
        .await
    }

    /// Close the receiver. Later receives fail with
    /// [`ServiceBusError::LinkClosed`].
    #[instrument(skip(self, ctx), fields(entity_path = %self.entity_path))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let result = match self.receiver.close().await {
            Some(receiver) => receiver.close(ctx).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Failed to close receiver");
        }

        info!("Subscription closed");
        result
    }
}

#[async_trait]
impl MessageReceiver for Subscription {
    async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        Subscription::listen(self, ctx, handler).await
    }

    async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        Subscription::receive_one(self, ctx, handler).await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("entity_path", &self.entity_path)
            .field("receive_mode", &self.receiver_options.receive_mode)
            .field("closed", &self.receiver.is_closed())
            .finish()
    }
}
