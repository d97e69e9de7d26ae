//! Topic facade: a lazily attached sender plus the topic's management node.
//!
//! Topics are only sent to. Messages are read through the topic's
//! subscriptions, see [`Topic::subscription`].

use crate::batch::BatchIterator;
use crate::config::ServiceBusConfig;
use crate::context::OperationContext;
use crate::entity::{subscription_path, Entity};
use crate::error::ServiceBusError;
use crate::link::LinkHost;
use crate::message::{Message, SendOptions};
use crate::sender::{MessageSender, Sender, SenderOptions};
use crate::slot::LinkSlot;
use crate::subscription::{Subscription, SubscriptionOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[cfg(test)]
#[path = "topic_tests.rs"]
mod tests;

/// A topic with a lazily attached sender
pub struct Topic {
    name: String,
    host: Arc<dyn LinkHost>,
    config: ServiceBusConfig,
    entity: Entity,
    sender_options: SenderOptions,
    sender: LinkSlot<Sender>,
}

impl Topic {
    /// Topic `name` configured from `config`; nothing is attached yet
    pub fn new(
        host: Arc<dyn LinkHost>,
        name: impl Into<String>,
        config: &ServiceBusConfig,
    ) -> Self {
        let name = name.into();
        let entity = Entity::new(name.clone(), host.clone(), config.retry.clone())
            .with_default_page_size(config.peek_page_size);

        Self {
            entity,
            sender_options: SenderOptions {
                claim_refresh_interval: config.claim_refresh_interval(),
            },
            sender: LinkSlot::new(name.clone()),
            config: config.clone(),
            host,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Management operations on this topic
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Subscription `name` of this topic, addressed as
    /// `<topic>/Subscriptions/<name>`
    pub fn subscription(&self, name: &str, options: SubscriptionOptions) -> Subscription {
        Subscription::new(
            self.host.clone(),
            subscription_path(&self.name, name),
            &self.config,
            options,
        )
    }

    async fn sender(&self, ctx: &OperationContext) -> Result<Arc<Sender>, ServiceBusError> {
        self.sender
            .get_or_open(ctx, || {
                Sender::new(ctx, self.host.clone(), &self.name, self.sender_options.clone())
            })
            .await
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
        let codec = self.host.codec();
        let mut iterator = BatchIterator::new(self.config.max_message_size, messages, codec);
        self.send_batch(ctx, &mut iterator).await
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

    /// Close the sender. Later sends fail with [`ServiceBusError::LinkClosed`].
    #[instrument(skip(self, ctx), fields(entity_path = %self.name))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let result = match self.sender.close().await {
            Some(sender) => sender.close(ctx).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Failed to close sender");
        }

        info!("Topic closed");
        result
    }
}

#[async_trait]
impl MessageSender for Topic {
    async fn send(
        &self,
        ctx: &OperationContext,
        message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError> {
        Topic::send(self, ctx, message, options).await
    }

    async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError> {
        Topic::send_batch(self, ctx, iterator).await
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
