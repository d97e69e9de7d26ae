//! In-memory AMQP broker for testing and development.
//!
//! The broker implements the transport traits over per-address FIFO nodes:
//! - Competing receivers on the same address, each message delivered once
//! - Peek-lock deliveries tracked until settled; released or rejected
//!   deliveries, and those still unsettled when their link closes, return to
//!   the node, and dead-letter after the maximum delivery count
//! - Batch envelopes unpacked into their sub-messages on arrival
//! - Topics copying each arriving message to their registered subscriptions
//! - Request/response responders keyed by address, with replies routed to the
//!   request's `reply-to` node and correlated by message id
//! - One-shot failure injection for sends, session creation and link close
//!
//! A receiver link attached with a `target` address reads from the node of
//! that address. This is how request/response links pick up their replies.

use crate::amqp::{AmqpMessage, AmqpValue, JsonMessageCodec, MessageCodec, BATCH_MESSAGE_FORMAT};
use crate::cbs::CBS_ADDRESS;
use crate::entity::subscription_path;
use crate::error::TransportError;
use crate::transport::{
    AmqpConnection, AmqpDialer, AmqpReceiverLink, AmqpSenderLink, AmqpSession,
    ReceiveMode, ReceiverLinkOptions, RejectReason, SenderLinkOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
const LOCK_DURATION_SECONDS: i64 = 30;
const DEAD_LETTER_SUFFIX: &str = "/$DeadLetterQueue";

/// Produces the reply for a request sent to a responder address
pub trait Responder: Send + Sync {
    fn respond(&self, request: &AmqpMessage) -> AmqpMessage;
}

impl<F> Responder for F
where
    F: Fn(&AmqpMessage) -> AmqpMessage + Send + Sync,
{
    fn respond(&self, request: &AmqpMessage) -> AmqpMessage {
        self(request)
    }
}

/// Reply carrying `status-code` and `status-description`
pub fn status_reply(code: i32, description: &str) -> AmqpMessage {
    AmqpMessage::new()
        .with_application_property("status-code", code)
        .with_application_property("status-description", description)
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Accepted,
    Rejected,
    Released,
}

/// Settlement record kept for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub address: String,
    pub outcome: SettlementOutcome,
    pub message: AmqpMessage,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct Node {
    messages: VecDeque<AmqpMessage>,
    notify: Arc<Notify>,
}

impl Node {
    fn wake(&self) {
        // Filtered receivers may skip a message, so every waiter re-checks;
        // the extra permit covers a receiver that is about to wait.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A peek-lock delivery awaiting settlement
struct InFlight {
    link_id: Uuid,
    address: String,
    message: AmqpMessage,
}

#[derive(Default)]
struct Faults {
    send: VecDeque<TransportError>,
    session: VecDeque<TransportError>,
    link_close: VecDeque<TransportError>,
}

struct BrokerState {
    nodes: HashMap<String, Node>,
    responders: HashMap<String, Arc<dyn Responder>>,
    // topic -> subscription entity paths
    subscriptions: HashMap<String, Vec<String>>,
    in_flight: HashMap<Bytes, InFlight>,
    sent: Vec<(String, AmqpMessage)>,
    settlements: Vec<Settlement>,
    dialed: Vec<String>,
    sessions_created: usize,
    open_sessions: usize,
    next_sequence_number: i64,
    max_delivery_count: u32,
    faults: Faults,
}

impl BrokerState {
    fn new() -> Self {
        let mut responders: HashMap<String, Arc<dyn Responder>> = HashMap::new();
        responders.insert(
            CBS_ADDRESS.to_string(),
            Arc::new(|_: &AmqpMessage| status_reply(200, "OK")),
        );

        Self {
            nodes: HashMap::new(),
            responders,
            subscriptions: HashMap::new(),
            in_flight: HashMap::new(),
            sent: Vec::new(),
            settlements: Vec::new(),
            dialed: Vec::new(),
            sessions_created: 0,
            open_sessions: 0,
            next_sequence_number: 0,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            faults: Faults::default(),
        }
    }

    fn node(&mut self, address: &str) -> &mut Node {
        self.nodes.entry(address.to_string()).or_default()
    }

    /// Append a message as the entity would store it
    fn enqueue(&mut self, address: &str, mut message: AmqpMessage) {
        self.next_sequence_number += 1;
        message
            .annotations
            .entry("x-opt-sequence-number".to_string())
            .or_insert(AmqpValue::Long(self.next_sequence_number));
        message
            .annotations
            .entry("x-opt-enqueued-time".to_string())
            .or_insert(AmqpValue::Timestamp(Utc::now()));
        self.push(address, message);
    }

    /// Store a sent message on its address, or on every subscription when the
    /// address is a topic with subscriptions
    fn accept_sent(&mut self, address: &str, message: AmqpMessage) {
        match self.subscriptions.get(address).cloned() {
            Some(paths) => {
                for path in paths {
                    self.enqueue(&path, message.clone());
                }
            }
            None => self.enqueue(address, message),
        }
    }

    fn push(&mut self, address: &str, message: AmqpMessage) {
        let node = self.node(address);
        node.messages.push_back(message);
        node.wake();
    }

    fn take(&mut self, address: &str, session_filter: Option<&str>) -> Option<AmqpMessage> {
        let node = self.nodes.get_mut(address)?;
        let index = match session_filter {
            None => 0,
            Some(group) => node
                .messages
                .iter()
                .position(|m| m.properties.group_id.as_deref() == Some(group))?,
        };
        node.messages.remove(index)
    }

    /// Put an unsettled delivery back, or dead-letter it once it has been
    /// delivered too often
    fn redeliver(&mut self, address: &str, mut message: AmqpMessage) {
        message.delivery_tag = None;
        message.annotations.remove("x-opt-locked-until");
        let header = message.header.get_or_insert_with(Default::default);
        header.delivery_count += 1;

        if header.delivery_count >= self.max_delivery_count {
            message.application_properties.insert(
                "DeadLetterReason".to_string(),
                AmqpValue::from("MaxDeliveryCountExceeded"),
            );
            let dead_letter = format!("{}{}", address, DEAD_LETTER_SUFFIX);
            self.push(&dead_letter, message);
            return;
        }

        let node = self.node(address);
        node.messages.push_front(message);
        node.wake();
    }

    /// Return every unsettled delivery of a closing link, lowest sequence
    /// number at the front
    fn redeliver_link(&mut self, link_id: Uuid) {
        let tags: Vec<Bytes> = self
            .in_flight
            .iter()
            .filter(|(_, delivery)| delivery.link_id == link_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        let mut deliveries: Vec<InFlight> = tags
            .iter()
            .filter_map(|tag| self.in_flight.remove(tag))
            .collect();
        deliveries.sort_by_key(|delivery| {
            std::cmp::Reverse(
                delivery
                    .message
                    .annotation("x-opt-sequence-number")
                    .and_then(AmqpValue::as_i64),
            )
        });

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "Returning unsettled deliveries of closed link");
        }
        for delivery in deliveries {
            self.redeliver(&delivery.address, delivery.message);
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

struct BrokerInner {
    state: Mutex<BrokerState>,
    codec: Arc<dyn MessageCodec>,
}

/// Shared in-memory broker; clones refer to the same broker
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker whose `$cbs` node accepts every token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new()),
                codec: Arc::new(JsonMessageCodec),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a connection without going through [`AmqpDialer`]
    pub fn connect(&self) -> InMemoryConnection {
        InMemoryConnection {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Answer every request sent to `address` with `responder`
    pub fn set_responder(&self, address: impl Into<String>, responder: impl Responder + 'static) {
        self.state()
            .responders
            .insert(address.into(), Arc::new(responder));
    }

    /// Copy every message later sent to `topic` onto subscription `name`
    pub fn add_subscription(&self, topic: &str, name: &str) {
        self.state()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(subscription_path(topic, name));
    }

    pub fn set_max_delivery_count(&self, max_delivery_count: u32) {
        self.state().max_delivery_count = max_delivery_count.max(1);
    }

    /// Place a message on an address as if a client had sent it
    pub fn enqueue(&self, address: &str, message: AmqpMessage) {
        self.state().enqueue(address, message);
    }

    /// Fail the next send on any link
    pub fn inject_send_failure(&self, error: TransportError) {
        self.state().faults.send.push_back(error);
    }

    /// Fail the next session creation
    pub fn inject_session_failure(&self, error: TransportError) {
        self.state().faults.session.push_back(error);
    }

    /// Fail the next link close
    pub fn inject_link_close_failure(&self, error: TransportError) {
        self.state().faults.link_close.push_back(error);
    }

    /// Messages sent to `address`, in order
    pub fn sent_to(&self, address: &str) -> Vec<AmqpMessage> {
        self.state()
            .sent
            .iter()
            .filter(|(target, _)| target == address)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    /// Messages waiting on `address`
    pub fn pending(&self, address: &str) -> usize {
        self.state()
            .nodes
            .get(address)
            .map(|node| node.messages.len())
            .unwrap_or(0)
    }

    pub fn sessions_created(&self) -> usize {
        self.state().sessions_created
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    pub fn dialed_hosts(&self) -> Vec<String> {
        self.state().dialed.clone()
    }

    fn deliver(&self, address: &str, message: AmqpMessage) -> Result<(), TransportError> {
        let responder = {
            let mut state = self.state();
            if let Some(error) = state.faults.send.pop_front() {
                return Err(error);
            }
            state.sent.push((address.to_string(), message.clone()));
            state.responders.get(address).cloned()
        };

        if let Some(responder) = responder {
            // Called without the state lock so responders may use the broker.
            let mut reply = responder.respond(&message);
            reply.properties.correlation_id = message.properties.message_id.clone();
            match message.properties.reply_to.as_deref() {
                Some(reply_to) => self.state().push(reply_to, reply),
                None => debug!(address, "Request without reply-to, dropping reply"),
            }
            return Ok(());
        }

        if message.format == BATCH_MESSAGE_FORMAT {
            let mut inner = Vec::with_capacity(message.data.len());
            for section in &message.data {
                let decoded =
                    self.inner
                        .codec
                        .decode(section)
                        .map_err(|e| TransportError::Amqp {
                            condition: "amqp:decode-error".to_string(),
                            description: e.to_string(),
                        })?;
                inner.push(decoded);
            }
            let mut state = self.state();
            for sub_message in inner {
                state.accept_sent(address, sub_message);
            }
            return Ok(());
        }

        self.state().accept_sent(address, message);
        Ok(())
    }

    fn close_link(&self) -> Result<(), TransportError> {
        match self.state().faults.link_close.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AmqpDialer for InMemoryBroker {
    async fn dial(&self, host: &str) -> Result<Box<dyn AmqpConnection>, TransportError> {
        self.state().dialed.push(host.to_string());
        Ok(Box::new(self.connect()))
    }
}

// ============================================================================
// Connection, session and links
// ============================================================================

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    async fn new_session(&self) -> Result<Box<dyn AmqpSession>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed {
                message: "connection has been closed".to_string(),
            });
        }

        let mut state = self.broker.state();
        if let Some(error) = state.faults.session.pop_front() {
            return Err(error);
        }
        state.sessions_created += 1;
        state.open_sessions += 1;

        Ok(Box::new(InMemorySession {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn codec(&self) -> Arc<dyn MessageCodec> {
        Arc::clone(&self.broker.inner.codec)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionClosed {
                message: "session has been closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpSession for InMemorySession {
    async fn new_sender(
        &self,
        options: SenderLinkOptions,
    ) -> Result<Arc<dyn AmqpSenderLink>, TransportError> {
        self.ensure_open()?;
        Ok(Arc::new(InMemorySenderLink {
            broker: self.broker.clone(),
            target: options.target,
            closed: AtomicBool::new(false),
        }))
    }

    async fn new_receiver(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<Arc<dyn AmqpReceiverLink>, TransportError> {
        self.ensure_open()?;
        let address = options.target.unwrap_or(options.source);
        let notify = Arc::clone(&self.broker.state().node(&address).notify);
        let session_locked_until = match (&options.session_filter, options.receive_mode) {
            (Some(_), ReceiveMode::PeekLock) => {
                Some(Utc::now() + ChronoDuration::seconds(LOCK_DURATION_SECONDS))
            }
            _ => None,
        };

        Ok(Arc::new(InMemoryReceiverLink {
            id: Uuid::new_v4(),
            broker: self.broker.clone(),
            address,
            receive_mode: options.receive_mode,
            session_filter: options.session_filter,
            session_locked_until,
            notify,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = self.broker.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

struct InMemorySenderLink {
    broker: InMemoryBroker,
    target: String,
    closed: AtomicBool,
}

#[async_trait]
impl AmqpSenderLink for InMemorySenderLink {
    async fn send(&self, message: AmqpMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::LinkDetached {
                message: format!("sender link to '{}' is closed", self.target),
            });
        }
        self.broker.deliver(&self.target, message)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.broker.close_link()
    }
}

struct InMemoryReceiverLink {
    id: Uuid,
    broker: InMemoryBroker,
    address: String,
    receive_mode: ReceiveMode,
    session_filter: Option<String>,
    session_locked_until: Option<DateTime<Utc>>,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl InMemoryReceiverLink {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::LinkDetached {
                message: format!("receiver link on '{}' is closed", self.address),
            });
        }
        Ok(())
    }

    fn try_take(&self) -> Option<AmqpMessage> {
        let mut state = self.broker.state();
        let mut message = state.take(&self.address, self.session_filter.as_deref())?;

        let tag = Bytes::copy_from_slice(&Uuid::new_v4().to_bytes_le());
        message.delivery_tag = Some(tag.clone());

        if self.receive_mode == ReceiveMode::PeekLock {
            let locked_until = Utc::now() + ChronoDuration::seconds(LOCK_DURATION_SECONDS);
            message.annotations.insert(
                "x-opt-locked-until".to_string(),
                AmqpValue::Timestamp(locked_until),
            );
            state.in_flight.insert(
                tag,
                InFlight {
                    link_id: self.id,
                    address: self.address.clone(),
                    message: message.clone(),
                },
            );
        }

        Some(message)
    }

    fn settle(
        &self,
        message: &AmqpMessage,
        outcome: SettlementOutcome,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let mut state = self.broker.state();
        state.settlements.push(Settlement {
            address: self.address.clone(),
            outcome,
            message: message.clone(),
        });

        let in_flight = message
            .delivery_tag
            .as_ref()
            .and_then(|tag| state.in_flight.remove(tag));

        if let Some(delivery) = in_flight {
            if outcome != SettlementOutcome::Accepted {
                state.redeliver(&delivery.address, delivery.message);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpReceiverLink for InMemoryReceiverLink {
    async fn receive(&self) -> Result<AmqpMessage, TransportError> {
        loop {
            self.ensure_open()?;
            if let Some(message) = self.try_take() {
                return Ok(message);
            }
            self.notify.notified().await;
        }
    }

    async fn accept(&self, message: &AmqpMessage) -> Result<(), TransportError> {
        self.settle(message, SettlementOutcome::Accepted)
    }

    async fn reject(
        &self,
        message: &AmqpMessage,
        reason: Option<RejectReason>,
    ) -> Result<(), TransportError> {
        if let Some(reason) = reason {
            debug!(
                address = %self.address,
                condition = %reason.condition,
                description = %reason.description,
                "Delivery rejected"
            );
        }
        self.settle(message, SettlementOutcome::Rejected)
    }

    async fn release(&self, message: &AmqpMessage) -> Result<(), TransportError> {
        self.settle(message, SettlementOutcome::Released)
    }

    fn session_locked_until(&self) -> Option<DateTime<Utc>> {
        self.session_locked_until
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.state().redeliver_link(self.id);
        }
        self.notify.notify_waiters();
        self.broker.close_link()
    }
}
