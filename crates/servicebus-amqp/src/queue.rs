//! Queue facade over a sender, a receiver and the queue's management node.
//!
//! Links are attached on first use: the first send builds the sender, the
//! first receive builds the receiver. Each lives in its own [`LinkSlot`] so
//! sending never waits on receiving.

use crate::batch::BatchIterator;
use crate::config::ServiceBusConfig;
use crate::context::OperationContext;
use crate::entity::{dead_letter_path, transfer_dead_letter_path, Entity};
use crate::error::{BatchDispositionErrors, ServiceBusError};
use crate::link::LinkHost;
use crate::message::{Message, SendOptions};
use crate::peek::{PeekIterator, PeekOptions};
use crate::receiver::{Handler, ListenerHandle, MessageReceiver, Receiver, ReceiverOptions};
use crate::retry::RetryConfig;
use crate::sender::{MessageSender, Sender, SenderOptions};
use crate::session_receiver::SessionReceiver;
use crate::slot::LinkSlot;
use crate::transport::ReceiveMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

/// Per-queue overrides of the namespace configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub receive_mode: ReceiveMode,
    /// Link credit; the configured prefetch when `None`
    pub prefetch: Option<u32>,
    /// Only receive messages of this messaging session
    pub session_filter: Option<String>,
}

impl QueueOptions {
    /// Peek-lock with the configured prefetch and no session filter
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    /// Prefetch of at least one message
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch.max(1));
        self
    }

    pub fn with_session_filter(mut self, group_id: impl Into<String>) -> Self {
        self.session_filter = Some(group_id.into());
        self
    }
}

/// A queue with lazily attached links
pub struct Queue {
    name: String,
    host: Arc<dyn LinkHost>,
    entity: Entity,
    sender_options: SenderOptions,
    receiver_options: ReceiverOptions,
    retry: RetryConfig,
    max_message_size: usize,
    sender: LinkSlot<Sender>,
    receiver: LinkSlot<Receiver>,
}

impl Queue {
    pub fn new(
        host: Arc<dyn LinkHost>,
        name: impl Into<String>,
        config: &ServiceBusConfig,
        options: QueueOptions,
    ) -> Self {
        let name = name.into();
        let entity = Entity::new(name.clone(), host.clone(), config.retry.clone())
            .with_default_page_size(config.peek_page_size);
        let claim_refresh_interval = config.claim_refresh_interval();

        Self {
            entity,
            host,
            sender_options: SenderOptions {
                claim_refresh_interval,
            },
            receiver_options: ReceiverOptions {
                receive_mode: options.receive_mode,
                prefetch: options.prefetch.unwrap_or(config.receiver_prefetch).max(1),
                session_filter: options.session_filter,
                claim_refresh_interval,
            },
            retry: config.retry.clone(),
            max_message_size: config.max_message_size,
            sender: LinkSlot::new(name.clone()),
            receiver: LinkSlot::new(name.clone()),
            name,
        }
    }

    /// Entity path of the queue
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Management operations on this queue
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Settlement mode of the queue's receivers
    pub fn receive_mode(&self) -> ReceiveMode {
        self.receiver_options.receive_mode
    }

    async fn sender(&self, ctx: &OperationContext) -> Result<Arc<Sender>, ServiceBusError> {
        // The receiver slot closes first
        self.ensure_open()?;
        self.sender
            .get_or_open(ctx, || {
                Sender::new(ctx, self.host.clone(), &self.name, self.sender_options.clone())
            })
            .await
    }

    async fn receiver(&self, ctx: &OperationContext) -> Result<Arc<Receiver>, ServiceBusError> {
        self.receiver
            .get_or_open(ctx, || {
                Receiver::new(ctx, self.host.clone(), &self.name, self.receiver_options.clone())
            })
            .await
    }

    fn ensure_open(&self) -> Result<(), ServiceBusError> {
        if self.receiver.is_closed() {
            return Err(ServiceBusError::LinkClosed {
                entity_path: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Send `message`, attaching the sender on first use
    pub async fn send(
        &self,
        ctx: &OperationContext,
        message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError> {
        self.sender(ctx).await?.send(ctx, message, options).await
    }

    /// Send every batch `iterator` produces
    pub async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError> {
        self.sender(ctx).await?.send_batch(ctx, iterator).await
    }

    /// Batch `messages` up to the configured message size and send them
    pub async fn send_messages(
        &self,
        ctx: &OperationContext,
        messages: Vec<Message>,
    ) -> Result<(), ServiceBusError> {
        let mut iterator = BatchIterator::new(self.max_message_size, messages, self.host.codec());
        self.send_batch(ctx, &mut iterator).await
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
    #[instrument(skip(self, ctx, handler), fields(entity_path = %self.name))]
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

    /// Return `message` to the queue, incrementing its delivery count
    pub async fn abandon(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        self.entity.abandon(ctx, message).await
    }

    /// Set `message` aside for [`Queue::receive_deferred`]
    pub async fn defer(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        self.entity.defer(ctx, message).await
    }

    /// Move `message` to the dead-letter sub-queue
    pub async fn dead_letter(
        &self,
        ctx: &OperationContext,
        message: &Message,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), ServiceBusError> {
        self.entity.dead_letter(ctx, message, reason, description).await
    }

    /// Complete messages by lock token, reporting each refused token
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

    /// Schedule `messages` for `enqueue_time`, returning their sequence numbers
    pub async fn schedule_at(
        &self,
        ctx: &OperationContext,
        enqueue_time: DateTime<Utc>,
        messages: &mut [Message],
    ) -> Result<Vec<i64>, ServiceBusError> {
        self.entity.schedule_messages(ctx, enqueue_time, messages).await
    }

    pub async fn cancel_scheduled(
        &self,
        ctx: &OperationContext,
        sequence_numbers: &[i64],
    ) -> Result<(), ServiceBusError> {
        self.entity.cancel_scheduled(ctx, sequence_numbers).await
    }

    /// Receive deferred messages in this queue's receive mode
    pub async fn receive_deferred(
        &self,
        ctx: &OperationContext,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, ServiceBusError> {
        self.entity
            .receive_deferred(ctx, self.receiver_options.receive_mode, sequence_numbers)
            .await
    }

    /// Receiver on the dead-letter sub-queue, owned by the caller
    pub async fn new_dead_letter_receiver(
        &self,
        ctx: &OperationContext,
    ) -> Result<Receiver, ServiceBusError> {
        self.sub_queue_receiver(ctx, dead_letter_path(&self.name)).await
    }

    /// Receiver on the transfer dead-letter sub-queue, owned by the caller
    pub async fn new_transfer_dead_letter_receiver(
        &self,
        ctx: &OperationContext,
    ) -> Result<Receiver, ServiceBusError> {
        self.sub_queue_receiver(ctx, transfer_dead_letter_path(&self.name))
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

    /// Lock messaging session `session_id` and receive its messages.
    ///
    /// The session receiver is owned by the caller and closed separately.
    pub async fn accept_session(
        &self,
        ctx: &OperationContext,
        session_id: &str,
    ) -> Result<SessionReceiver, ServiceBusError> {
        self.ensure_open()?;
        let entity = Entity::new(self.name.clone(), self.host.clone(), self.retry.clone());
        SessionReceiver::accept(
            ctx,
            self.host.clone(),
            entity,
            session_id,
            self.receiver_options.clone(),
        )
        .await
    }

    /// Close the receiver, then the sender.
    ///
    /// Both are attempted; the receiver's error wins. Later operations that
    /// need a link fail with [`ServiceBusError::LinkClosed`].
    #[instrument(skip(self, ctx), fields(entity_path = %self.name))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let receiver_result = match self.receiver.close().await {
            Some(receiver) => receiver.close(ctx).await,
            None => Ok(()),
        };
        if let Err(e) = &receiver_result {
            warn!(error = %e, "Failed to close receiver");
        }

        let sender_result = match self.sender.close().await {
            Some(sender) => sender.close(ctx).await,
            None => Ok(()),
        };
        if let Err(e) = &sender_result {
            warn!(error = %e, "Failed to close sender");
        }

        info!("Queue closed");
        receiver_result.and(sender_result)
    }
}

#[async_trait]
impl MessageSender for Queue {
    async fn send(
        &self,
        ctx: &OperationContext,
        message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError> {
        Queue::send(self, ctx, message, options).await
    }

    async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError> {
        Queue::send_batch(self, ctx, iterator).await
    }
}

#[async_trait]
impl MessageReceiver for Queue {
    async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        Queue::listen(self, ctx, handler).await
    }

    async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        Queue::receive_one(self, ctx, handler).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("receive_mode", &self.receiver_options.receive_mode)
            .field("closed", &self.receiver.is_closed())
            .finish()
    }
}
