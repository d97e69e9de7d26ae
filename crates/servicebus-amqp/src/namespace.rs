//! Namespace connection and the claims link shared by its entities.
//!
//! A [`Namespace`] owns one transport connection and, once the first claim is
//! needed, one `$cbs` link. Claims negotiation is serialized on that link.
//! Senders, receivers, queues, topics, subscriptions and entities built from
//! the namespace hold it
//! through the [`LinkHost`](crate::link::LinkHost) capability traits.

use crate::amqp::MessageCodec;
use crate::auth::TokenProvider;
use crate::cbs::CbsLink;
use crate::config::ServiceBusConfig;
use crate::context::OperationContext;
use crate::entity::{subscription_path, Entity};
use crate::error::ServiceBusError;
use crate::link::{ClaimNegotiator, SessionFactory};
use crate::queue::{Queue, QueueOptions};
use crate::receiver::{Receiver, ReceiverOptions};
use crate::retry::retry;
use crate::sender::{Sender, SenderOptions};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::topic::Topic;
use crate::transport::{AmqpConnection, AmqpDialer, AmqpSession};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "namespace_tests.rs"]
mod tests;

/// Connection to a Service Bus namespace
pub struct Namespace {
    config: ServiceBusConfig,
    connection: Box<dyn AmqpConnection>,
    token_provider: Arc<dyn TokenProvider>,
    cbs: Mutex<Option<CbsLink>>,
}

impl Namespace {
    /// Validate `config` and dial the namespace host
    #[instrument(skip_all, fields(namespace = %config.namespace))]
    pub async fn connect(
        ctx: &OperationContext,
        config: ServiceBusConfig,
        dialer: &dyn AmqpDialer,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Arc<Self>, ServiceBusError> {
        config.validate()?;

        let host = config.host();
        let connection = ctx
            .run(async { dialer.dial(&host).await.map_err(ServiceBusError::from) })
            .await?;
        info!(host = %host, "Connected to namespace");

        Ok(Self::new(config, connection, token_provider))
    }

    /// Wrap an already open connection
    pub fn new(
        config: ServiceBusConfig,
        connection: Box<dyn AmqpConnection>,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connection,
            token_provider,
            cbs: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServiceBusConfig {
        &self.config
    }

    pub fn sender_options(&self) -> SenderOptions {
        SenderOptions {
            claim_refresh_interval: self.config.claim_refresh_interval(),
        }
    }

    /// Receiver options carrying the configured prefetch and claim refresh
    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            prefetch: self.config.receiver_prefetch,
            claim_refresh_interval: self.config.claim_refresh_interval(),
            ..ReceiverOptions::default()
        }
    }

    pub async fn new_sender(
        self: &Arc<Self>,
        ctx: &OperationContext,
        entity_path: &str,
    ) -> Result<Sender, ServiceBusError> {
        Sender::new(ctx, self.clone(), entity_path, self.sender_options()).await
    }

    pub async fn new_receiver(
        self: &Arc<Self>,
        ctx: &OperationContext,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Receiver, ServiceBusError> {
        Receiver::new(ctx, self.clone(), entity_path, options).await
    }

    /// Queue facade; links are attached on first use
    pub fn queue(self: &Arc<Self>, name: impl Into<String>, options: QueueOptions) -> Queue {
        Queue::new(self.clone(), name, &self.config, options)
    }

    /// Topic facade; the sender is attached on first send
    pub fn topic(self: &Arc<Self>, name: impl Into<String>) -> Topic {
        Topic::new(self.clone(), name, &self.config)
    }

    /// Subscription `name` of `topic`
    pub fn subscription(
        self: &Arc<Self>,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Subscription {
        Subscription::new(
            self.clone(),
            subscription_path(topic, name),
            &self.config,
            options,
        )
    }

    /// Management operations on `name`
    pub fn entity(self: &Arc<Self>, name: impl Into<String>) -> Entity {
        Entity::new(name, self.clone(), self.config.retry.clone())
            .with_default_page_size(self.config.peek_page_size)
    }

    /// Close the claims link, then the connection.
    ///
    /// Links built from this namespace stop working once it is closed.
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let cbs = self.cbs.lock().await.take();
        let cbs_result = match cbs {
            Some(link) => link.close(ctx).await,
            None => Ok(()),
        };
        let connection_result = ctx
            .run(async { self.connection.close().await.map_err(ServiceBusError::from) })
            .await;

        info!(namespace = %self.config.namespace, "Namespace closed");
        cbs_result.and(connection_result)
    }

    /// One put-token exchange, opening the claims link when none is cached
    async fn negotiate_once(
        &self,
        ctx: &OperationContext,
        audience: &str,
    ) -> Result<(), ServiceBusError> {
        let mut cached = ctx.run(async { Ok(self.cbs.lock().await) }).await?;
        let token = ctx.run(self.token_provider.get_token(audience)).await?;

        let link = match cached.take() {
            Some(link) => link,
            None => {
                let session = self.new_session(ctx).await?;
                let link = CbsLink::open(ctx, session).await?;
                debug!(client_address = %link.client_address(), "Claims link opened");
                link
            }
        };

        let result = link.negotiate(ctx, audience, &token).await;
        match &result {
            Err(ServiceBusError::Transport(e)) => {
                warn!(error = %e, "Claims link failed, reopening on next negotiation");
                if let Err(close_error) = link.close(ctx).await {
                    debug!(error = %close_error, "Failed to close broken claims link");
                }
            }
            _ => *cached = Some(link),
        }
        result
    }
}

#[async_trait]
impl ClaimNegotiator for Namespace {
    #[instrument(skip(self, ctx))]
    async fn negotiate_claim(
        &self,
        ctx: &OperationContext,
        entity_path: &str,
    ) -> Result<(), ServiceBusError> {
        let audience = self.config.resource_uri(entity_path);
        retry(ctx, &self.config.retry.claims, |_| self.negotiate_once(ctx, &audience)).await?;

        debug!(audience = %audience, "Claim negotiated");
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for Namespace {
    async fn new_session(
        &self,
        ctx: &OperationContext,
    ) -> Result<Box<dyn AmqpSession>, ServiceBusError> {
        ctx.run(async { self.connection.new_session().await.map_err(ServiceBusError::from) })
            .await
    }

    fn codec(&self) -> Arc<dyn MessageCodec> {
        self.connection.codec()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("host", &self.config.host())
            .finish()
    }
}
