//! Receiving link to one entity.
//!
//! A [`Receiver`] owns a session and a receiver link. Messages are consumed
//! either one at a time with [`Receiver::receive_one`] or continuously with
//! [`Receiver::listen`], which runs two tasks:
//!
//! - a read task pulling deliveries off the link into an unbounded channel,
//!   holding at most `prefetch` unsettled deliveries at a time
//! - a dispatch task running the [`Handler`] for each message in order and
//!   settling it: accepted when the handler succeeds, rejected when it fails.
//!   In receive-and-delete mode nothing is settled.
//!
//! Deliveries still buffered when the listener stops are released back to the
//! entity. Link state follows the same rules as the sender: one async mutex
//! per instance and a `Linked`, `Closed` or `Failed` state.

use crate::amqp::AmqpMessage;
use crate::cbs::ClaimRefresher;
use crate::context::OperationContext;
use crate::error::{ServiceBusError, TransportError};
use crate::link::LinkHost;
use crate::message::Message;
use crate::sender::DEFAULT_CLAIM_REFRESH_INTERVAL;
use crate::transport::{
    AmqpReceiverLink, AmqpSession, ReceiveMode, ReceiverLinkOptions, RejectReason,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// Condition reported when a handler fails a message
pub const HANDLER_ERROR_CONDITION: &str = "amqp:internal-error";

/// Processes received messages
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one message; an error rejects it
    async fn handle(&self, ctx: &OperationContext, message: Message) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Handler`]
pub struct HandlerFunc<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFunc<F>
where
    F: Fn(OperationContext, Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: &OperationContext, message: Message) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), message).await
    }
}

/// Receiving side of an entity
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Dispatch every incoming message to `handler` until stopped
    async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError>;

    /// Receive and handle exactly one message
    async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError>;
}

/// Options for building a receiver link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,
    /// Link credit; how many messages the entity may push ahead of handling
    pub prefetch: u32,
    /// Only receive messages of this messaging session
    pub session_filter: Option<String>,
    /// Claim renewal interval; `None` disables renewal
    pub claim_refresh_interval: Option<Duration>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::PeekLock,
            prefetch: 1,
            session_filter: None,
            claim_refresh_interval: Some(DEFAULT_CLAIM_REFRESH_INTERVAL),
        }
    }
}

impl ReceiverOptions {
    pub fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_session_filter(mut self, group_id: impl Into<String>) -> Self {
        self.session_filter = Some(group_id.into());
        self
    }
}

// ============================================================================
// Listener handle
// ============================================================================

struct ListenerInner {
    cancel: CancellationToken,
    finished: CancellationToken,
    error: StdMutex<Option<ServiceBusError>>,
}

/// Control over a running listener; clones refer to the same listener
#[derive(Clone)]
pub struct ListenerHandle {
    inner: Arc<ListenerInner>,
}

impl ListenerHandle {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                cancel,
                finished: CancellationToken::new(),
                error: StdMutex::new(None),
            }),
        }
    }

    /// Wait until both listener tasks have stopped
    pub async fn done(&self) {
        self.inner.finished.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// Stop listening and wait for the tasks. A handler already running
    /// finishes and settles its message first.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.done().await;
    }

    /// Error that stopped the listener, if any; taken at most once
    pub fn take_error(&self) -> Option<ServiceBusError> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn fail(&self, error: ServiceBusError) {
        let mut slot = self
            .inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.get_or_insert(error);
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("is_done", &self.is_done())
            .finish()
    }
}

// ============================================================================
// Receiver
// ============================================================================

struct ReceiverLink {
    session: Box<dyn AmqpSession>,
    link: Arc<dyn AmqpReceiverLink>,
    _refresher: Option<ClaimRefresher>,
}

impl ReceiverLink {
    /// Close the link, then the session even when the link close fails.
    /// The link error wins.
    async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let link = ctx
            .run(async { self.link.close().await.map_err(ServiceBusError::from) })
            .await;
        let session = ctx
            .run(async { self.session.close().await.map_err(ServiceBusError::from) })
            .await;
        link.and(session)
    }
}

enum LinkState {
    Linked(ReceiverLink),
    Closed,
    Failed(String),
}

struct ReceiverState {
    link: LinkState,
    listener: Option<ListenerHandle>,
}

impl ReceiverState {
    fn linked(&self, entity_path: &str) -> Result<&ReceiverLink, ServiceBusError> {
        match &self.link {
            LinkState::Linked(link) => Ok(link),
            LinkState::Closed => Err(ServiceBusError::LinkClosed {
                entity_path: entity_path.to_string(),
            }),
            LinkState::Failed(reason) => Err(ServiceBusError::LinkFailed {
                entity_path: entity_path.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Stop an active listener and wait for it
    async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.close().await;
        }
    }
}

/// Receiver link to one entity path
pub struct Receiver {
    host: Arc<dyn LinkHost>,
    entity_path: String,
    options: ReceiverOptions,
    state: Mutex<ReceiverState>,
}

impl Receiver {
    /// Negotiate a claim for `entity_path` and attach a receiver link to it
    #[instrument(skip(ctx, host, options))]
    pub async fn new(
        ctx: &OperationContext,
        host: Arc<dyn LinkHost>,
        entity_path: &str,
        options: ReceiverOptions,
    ) -> Result<Self, ServiceBusError> {
        let link = build_link(ctx, &host, entity_path, &options).await?;
        info!(entity_path, mode = ?options.receive_mode, "Receiver linked");

        Ok(Self {
            host,
            entity_path: entity_path.to_string(),
            options,
            state: Mutex::new(ReceiverState {
                link: LinkState::Linked(link),
                listener: None,
            }),
        })
    }

    /// Entity path the link is attached to
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Settlement mode the link was attached with
    pub fn receive_mode(&self) -> ReceiveMode {
        self.options.receive_mode
    }

    /// Expiry of the session lock held by the current link
    pub(crate) async fn session_locked_until(
        &self,
        ctx: &OperationContext,
    ) -> Result<Option<DateTime<Utc>>, ServiceBusError> {
        let state = self.lock_state(ctx).await?;
        Ok(state.linked(&self.entity_path)?.link.session_locked_until())
    }

    async fn lock_state(
        &self,
        ctx: &OperationContext,
    ) -> Result<MutexGuard<'_, ReceiverState>, ServiceBusError> {
        ctx.run(async { Ok(self.state.lock().await) }).await
    }

    /// Start dispatching messages to `handler`.
    ///
    /// Listening stops when `ctx` is cancelled, when the returned handle is
    /// closed, or when the link fails; the failure is then available from
    /// [`ListenerHandle::take_error`]. Only one listener may run at a time.
    #[instrument(skip(self, ctx, handler), fields(entity_path = %self.entity_path))]
    pub async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        let mut state = self.lock_state(ctx).await?;
        let link = Arc::clone(&state.linked(&self.entity_path)?.link);

        if state.listener.as_ref().is_some_and(|l| !l.is_done()) {
            return Err(ServiceBusError::AlreadyListening {
                entity_path: self.entity_path.clone(),
            });
        }

        let listen_ctx = ctx.child();
        let handle = ListenerHandle::new(listen_ctx.token().clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.options.prefetch.max(1) as usize));

        let reader = tokio::spawn(read_loop(
            Arc::clone(&link),
            listen_ctx.token().clone(),
            credit,
            tx,
            handle.clone(),
        ));
        tokio::spawn(dispatch_loop(DispatchContext {
            ctx: listen_ctx,
            link,
            handler,
            mode: self.options.receive_mode,
            entity_path: self.entity_path.clone(),
            rx,
            reader,
            handle: handle.clone(),
        }));

        debug!("Listener started");
        state.listener = Some(handle.clone());
        Ok(handle)
    }

    /// Receive one message, run `handler` on it and settle it.
    ///
    /// Fails when a listener is active.
    #[instrument(skip(self, ctx, handler), fields(entity_path = %self.entity_path))]
    pub async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        let link = {
            let state = self.lock_state(ctx).await?;
            if state.listener.as_ref().is_some_and(|l| !l.is_done()) {
                return Err(ServiceBusError::AlreadyListening {
                    entity_path: self.entity_path.clone(),
                });
            }
            Arc::clone(&state.linked(&self.entity_path)?.link)
        };

        let amqp = ctx
            .run(async { link.receive().await.map_err(ServiceBusError::from) })
            .await?;
        let result = handler.handle(ctx, Message::from_amqp(amqp.clone())).await;
        ctx.run(async {
            settle(link.as_ref(), self.options.receive_mode, &amqp, result)
                .await
                .map_err(ServiceBusError::from)
        })
        .await
    }

    /// Close the current link and build a new one.
    ///
    /// An active listener is stopped first and not restarted. A failed close
    /// or rebuild leaves the receiver `Failed`.
    #[instrument(skip(self, ctx), fields(entity_path = %self.entity_path))]
    pub async fn recover(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let mut state = self.lock_state(ctx).await?;
        state.stop_listener().await;

        if let LinkState::Linked(link) = std::mem::replace(&mut state.link, LinkState::Closed) {
            if let Err(e) = link.close(ctx).await {
                warn!(error = %e, "Closing receiver link during recovery failed");
                state.link = LinkState::Failed(e.to_string());
                return Err(e);
            }
        }

        match build_link(ctx, &self.host, &self.entity_path, &self.options).await {
            Ok(link) => {
                state.link = LinkState::Linked(link);
                info!("Receiver recovered");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Receiver recovery failed");
                state.link = LinkState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop the listener, then close the link and the session.
    ///
    /// The session is closed even when the link close fails; the link error is
    /// returned. Closing a closed receiver is a no-op.
    #[instrument(skip(self, ctx), fields(entity_path = %self.entity_path))]
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let mut state = self.lock_state(ctx).await?;
        state.stop_listener().await;

        match std::mem::replace(&mut state.link, LinkState::Closed) {
            LinkState::Linked(link) => link.close(ctx).await,
            LinkState::Closed | LinkState::Failed(_) => Ok(()),
        }
    }
}

#[async_trait]
impl MessageReceiver for Receiver {
    async fn listen(
        &self,
        ctx: &OperationContext,
        handler: Arc<dyn Handler>,
    ) -> Result<ListenerHandle, ServiceBusError> {
        Receiver::listen(self, ctx, handler).await
    }

    async fn receive_one(
        &self,
        ctx: &OperationContext,
        handler: &dyn Handler,
    ) -> Result<(), ServiceBusError> {
        Receiver::receive_one(self, ctx, handler).await
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("entity_path", &self.entity_path)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Listener tasks
// ============================================================================

/// A delivery handed to the dispatch task with the credit it holds
type Delivery = (AmqpMessage, OwnedSemaphorePermit);

async fn read_loop(
    link: Arc<dyn AmqpReceiverLink>,
    cancel: CancellationToken,
    credit: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Delivery>,
    handle: ListenerHandle,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&credit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = link.receive() => received,
        };

        match received {
            Ok(message) => {
                if tx.send((message, permit)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Receive failed, stopping listener");
                handle.fail(e.into());
                break;
            }
        }
    }
}

struct DispatchContext {
    ctx: OperationContext,
    link: Arc<dyn AmqpReceiverLink>,
    handler: Arc<dyn Handler>,
    mode: ReceiveMode,
    entity_path: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    reader: tokio::task::JoinHandle<()>,
    handle: ListenerHandle,
}

async fn dispatch_loop(mut dispatch: DispatchContext) {
    let cancel = dispatch.ctx.token().clone();

    loop {
        let (amqp, _permit) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = dispatch.rx.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let message = Message::from_amqp(amqp.clone());
        let message_id = message.id.clone();
        let result = dispatch.handler.handle(&dispatch.ctx, message).await;
        if let Err(e) = &result {
            debug!(
                entity_path = %dispatch.entity_path,
                message_id = %message_id,
                error = %e,
                "Handler failed"
            );
        }

        if let Err(e) = settle(dispatch.link.as_ref(), dispatch.mode, &amqp, result).await {
            warn!(
                entity_path = %dispatch.entity_path,
                message_id = %message_id,
                error = %e,
                "Failed to settle message"
            );
        }
    }

    // Stop the reader as well when the loop ends on its own
    cancel.cancel();
    if let Err(e) = (&mut dispatch.reader).await {
        warn!(entity_path = %dispatch.entity_path, error = %e, "Listener read task panicked");
    }
    release_undispatched(&mut dispatch).await;
    dispatch.handle.inner.finished.cancel();
    debug!(entity_path = %dispatch.entity_path, "Listener stopped");
}

/// Hand back deliveries the handler never saw, newest first so the entity
/// keeps its order
async fn release_undispatched(dispatch: &mut DispatchContext) {
    dispatch.rx.close();
    let mut undispatched = Vec::new();
    while let Ok((message, _permit)) = dispatch.rx.try_recv() {
        undispatched.push(message);
    }
    if undispatched.is_empty() || dispatch.mode == ReceiveMode::ReceiveAndDelete {
        return;
    }

    debug!(
        entity_path = %dispatch.entity_path,
        count = undispatched.len(),
        "Releasing undispatched deliveries"
    );
    for message in undispatched.iter().rev() {
        if let Err(e) = dispatch.link.release(message).await {
            warn!(
                entity_path = %dispatch.entity_path,
                message_id = message.message_id().unwrap_or_default(),
                error = %e,
                "Failed to release message"
            );
        }
    }
}

/// Accept on handler success, reject on failure; nothing in receive-and-delete
async fn settle(
    link: &dyn AmqpReceiverLink,
    mode: ReceiveMode,
    message: &AmqpMessage,
    result: anyhow::Result<()>,
) -> Result<(), TransportError> {
    if mode == ReceiveMode::ReceiveAndDelete {
        return Ok(());
    }

    match result {
        Ok(()) => link.accept(message).await,
        Err(e) => {
            let reason = RejectReason::new(HANDLER_ERROR_CONDITION, format!("{:#}", e));
            link.reject(message, Some(reason)).await
        }
    }
}

/// Construction path shared by [`Receiver::new`] and [`Receiver::recover`]
async fn build_link(
    ctx: &OperationContext,
    host: &Arc<dyn LinkHost>,
    entity_path: &str,
    options: &ReceiverOptions,
) -> Result<ReceiverLink, ServiceBusError> {
    host.negotiate_claim(ctx, entity_path).await?;
    let session = host.new_session(ctx).await?;

    let link_options = ReceiverLinkOptions {
        credit: options.prefetch.max(1),
        receive_mode: options.receive_mode,
        session_filter: options.session_filter.clone(),
        name: Some(format!("receiver-{}", Uuid::new_v4())),
        ..ReceiverLinkOptions::new(entity_path)
    };
    let attached = ctx
        .run(async {
            session
                .new_receiver(link_options)
                .await
                .map_err(ServiceBusError::from)
        })
        .await;

    let link = match attached {
        Ok(link) => link,
        Err(e) => {
            if let Err(close_error) = session.close().await {
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

    Ok(ReceiverLink {
        session,
        link,
        _refresher: refresher,
    })
}
