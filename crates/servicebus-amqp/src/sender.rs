//! Sending link to one entity.
//!
//! A [`Sender`] owns a session and a sender link for its entity path. Link
//! state lives behind one async mutex, so `send`, `send_batch`, `recover` and
//! `close` on the same instance run one at a time.
//!
//! States: `Linked` after construction or a successful recover, `Closed` after
//! close, `Failed` when a recover could not rebuild the link. Sends on a
//! `Closed` link fail with [`ServiceBusError::LinkClosed`], on a `Failed` link
//! with [`ServiceBusError::LinkFailed`] until a later recover succeeds.

use crate::batch::BatchIterator;
use crate::cbs::ClaimRefresher;
use crate::context::OperationContext;
use crate::error::ServiceBusError;
use crate::link::LinkHost;
use crate::message::{Message, SendOptions};
use crate::session::Session;
use crate::transport::{AmqpSenderLink, SenderLinkOptions};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Default interval between claim renewals of a link
pub const DEFAULT_CLAIM_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Sending side of an entity
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a single message
    async fn send(
        &self,
        ctx: &OperationContext,
        message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError>;

    /// Send every batch produced by `iterator`
    async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError>;
}

/// Options for building a sender link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderOptions {
    /// Claim renewal interval; `None` disables renewal
    pub claim_refresh_interval: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            claim_refresh_interval: Some(DEFAULT_CLAIM_REFRESH_INTERVAL),
        }
    }
}

/// Session, link and claim refresher of a linked sender
struct SenderLink {
    session: Session,
    link: Arc<dyn AmqpSenderLink>,
    _refresher: Option<ClaimRefresher>,
}

impl SenderLink {
    /// Stamp the session group and the next group sequence on messages that
    /// declare no group of their own
    fn prepare_message(&self, message: &mut Message) {
        if message.group_id.is_none() {
            message.group_id = Some(self.session.group_id().to_string());
            message.group_sequence = Some(self.session.next());
        }
    }

    /// Close the link, then the session even when the link close fails.
    /// The link error wins.
    async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let link = ctx
            .run(async { self.link.close().await.map_err(ServiceBusError::from) })
            .await;
        let session = ctx
            .run(async { self.session.close().await.map_err(ServiceBusError::from) })
            .await;

        if let (Err(link_error), Err(session_error)) = (&link, &session) {
            warn!(
                link_error = %link_error,
                session_error = %session_error,
                "Sender link and session both failed to close"
            );
        }
        link.and(session)
    }
}

enum LinkState {
    Linked(SenderLink),
    Closed,
    Failed(String),
}

impl LinkState {
    fn linked(&self, entity_path: &str) -> Result<&SenderLink, ServiceBusError> {
        match self {
            Self::Linked(link) => Ok(link),
            Self::Closed => Err(ServiceBusError::LinkClosed {
                entity_path: entity_path.to_string(),
            }),
            Self::Failed(reason) => Err(ServiceBusError::LinkFailed {
                entity_path: entity_path.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Sender link to one entity path
pub struct Sender {
    host: Arc<dyn LinkHost>,
    entity_path: String,
    options: SenderOptions,
    state: Mutex<LinkState>,
}

impl Sender {
    /// Negotiate a claim for `entity_path` and attach a sender link to it
    #[instrument(skip(ctx, host, options))]
    pub async fn new(
        ctx: &OperationContext,
        host: Arc<dyn LinkHost>,
        entity_path: &str,
        options: SenderOptions,
    ) -> Result<Self, ServiceBusError> {
        let link = build_link(ctx, &host, entity_path, &options).await?;
        info!(entity_path, "Sender linked");

        Ok(Self {
            host,
            entity_path: entity_path.to_string(),
            options,
            state: Mutex::new(LinkState::Linked(link)),
        })
    }

    /// Entity path the link is attached to
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    async fn lock_state(
        &self,
        ctx: &OperationContext,
    ) -> Result<MutexGuard<'_, LinkState>, ServiceBusError> {
        ctx.run(async { Ok(self.state.lock().await) }).await
    }

    /// Send one message.
    ///
    /// The message is stamped with the session group unless it has one,
    /// receives a UUID id when its id is empty, and then `options` are
    /// applied. There is a single attempt; on failure the caller decides
    /// whether to [`recover`](Self::recover) and resend.
    #[instrument(skip(self, ctx, message, options), fields(entity_path = %self.entity_path))]
    pub async fn send(
        &self,
        ctx: &OperationContext,
        mut message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError> {
        let state = self.lock_state(ctx).await?;
        let linked = state.linked(&self.entity_path)?;

        linked.prepare_message(&mut message);
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        options.apply(&mut message);

        debug!(
            message_id = %message.id,
            group_sequence = ?message.group_sequence,
            "Sending message"
        );
        let amqp = message.to_amqp();
        ctx.run(async { linked.link.send(amqp).await.map_err(ServiceBusError::from) })
            .await
    }

    /// Send every batch `iterator` produces, each as one batch envelope.
    ///
    /// Stops at the first failure; the iterator keeps its position so the
    /// caller may resume after recovery.
    #[instrument(skip(self, ctx, iterator), fields(entity_path = %self.entity_path))]
    pub async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError> {
        let state = self.lock_state(ctx).await?;
        let linked = state.linked(&self.entity_path)?;

        while !iterator.is_done() {
            let batch = match iterator.next()? {
                Some(batch) => batch,
                None => break,
            };
            debug!(
                batch_id = %batch.id(),
                messages = batch.len(),
                size = batch.size(),
                "Sending batch"
            );
            let envelope = batch.to_message();
            ctx.run(async { linked.link.send(envelope).await.map_err(ServiceBusError::from) })
                .await?;
        }
        Ok(())
    }

    /// Close the current session and link, then rebuild them.
    ///
    /// Close failures are logged and do not stop the rebuild. A failed rebuild
    /// leaves the sender `Failed`.
    #[instrument(skip(self, ctx), fields(entity_path = %self.entity_path))]
    pub async fn recover(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let mut state = self.lock_state(ctx).await?;

        if let LinkState::Linked(link) = std::mem::replace(&mut *state, LinkState::Closed) {
            if let Err(e) = link.close(ctx).await {
                warn!(error = %e, "Closing sender link during recovery failed");
            }
        }

        match build_link(ctx, &self.host, &self.entity_path, &self.options).await {
            Ok(link) => {
                *state = LinkState::Linked(link);
                info!("Sender recovered");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Sender recovery failed");
                *state = LinkState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Close the link, then the session.
    ///
    /// The session is closed even when the link close fails; the link error is
    /// returned. Closing a closed sender is a no-op.
    #[instrument(skip(self, ctx), fields(entity_path = %self.entity_path))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let mut state = self.lock_state(ctx).await?;
        match std::mem::replace(&mut *state, LinkState::Closed) {
            LinkState::Linked(link) => link.close(ctx).await,
            LinkState::Closed | LinkState::Failed(_) => Ok(()),
        }
    }
}

#[async_trait]
impl MessageSender for Sender {
    async fn send(
        &self,
        ctx: &OperationContext,
        message: Message,
        options: SendOptions,
    ) -> Result<(), ServiceBusError> {
        Sender::send(self, ctx, message, options).await
    }

    async fn send_batch(
        &self,
        ctx: &OperationContext,
        iterator: &mut BatchIterator,
    ) -> Result<(), ServiceBusError> {
        Sender::send_batch(self, ctx, iterator).await
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

/// Construction path shared by [`Sender::new`] and [`Sender::recover`]
async fn build_link(
    ctx: &OperationContext,
    host: &Arc<dyn LinkHost>,
    entity_path: &str,
    options: &SenderOptions,
) -> Result<SenderLink, ServiceBusError> {
    host.negotiate_claim(ctx, entity_path).await?;
    let transport = host.new_session(ctx).await?;

    let attached = ctx
        .run(async {
            transport
                .new_sender(SenderLinkOptions {
                    target: entity_path.to_string(),
                    name: Some(format!("sender-{}", Uuid::new_v4())),
                })
                .await
                .map_err(ServiceBusError::from)
        })
        .await;

    let link = match attached {
        Ok(link) => link,
        Err(e) => {
            if let Err(close_error) = transport.close().await {
                warn!(
                    entity_path,
                    error = %close_error,
                    "Failed to close session after attach failure"
                );
            }
            return Err(e);
        }
    };

    let refresher = options
        .claim_refresh_interval
        .map(|interval| ClaimRefresher::start(Arc::clone(host), entity_path, interval));

    Ok(SenderLink {
        session: Session::new(transport),
        link,
        _refresher: refresher,
    })
}
