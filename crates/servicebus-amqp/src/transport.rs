//! Interface to the underlying AMQP transport.
//!
//! The link layer drives connections, sessions and links only through these
//! traits. Frame encoding and flow control belong to the implementation.
//! Callers bound every suspending call with an
//! [`OperationContext`](crate::context::OperationContext), so implementations
//! must be cancel-safe: dropping a pending `receive` must not lose a message.

use crate::amqp::{AmqpMessage, MessageCodec};
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Settlement mode requested when a receiver link attaches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Messages stay locked until settled
    #[default]
    PeekLock,
    /// Messages are removed from the entity on delivery
    ReceiveAndDelete,
}

impl ReceiveMode {
    /// Value of `receiver-settle-mode` in management requests
    pub fn settle_mode_code(&self) -> u32 {
        match self {
            Self::PeekLock => 1,
            Self::ReceiveAndDelete => 0,
        }
    }
}

/// Options for attaching a sender link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderLinkOptions {
    /// Target address, usually an entity path
    pub target: String,
    pub name: Option<String>,
}

impl SenderLinkOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: None,
        }
    }
}

/// Options for attaching a receiver link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverLinkOptions {
    pub source: String,
    /// Target address; set for request/response links to receive replies
    pub target: Option<String>,
    /// Link credit granted to the sender side
    pub credit: u32,
    pub receive_mode: ReceiveMode,
    /// Only deliver messages of this messaging session
    pub session_filter: Option<String>,
    pub name: Option<String>,
}

impl ReceiverLinkOptions {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            credit: 1,
            receive_mode: ReceiveMode::PeekLock,
            session_filter: None,
            name: None,
        }
    }
}

/// Error condition attached to a rejected delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub condition: String,
    pub description: String,
}

impl RejectReason {
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
        }
    }
}

/// Opens connections to a namespace host
#[async_trait]
pub trait AmqpDialer: Send + Sync {
    async fn dial(&self, host: &str) -> Result<Box<dyn AmqpConnection>, TransportError>;
}

/// An open AMQP connection
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn AmqpSession>, TransportError>;

    /// Binary codec used for batch sub-messages and management payloads
    fn codec(&self) -> Arc<dyn MessageCodec>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// An AMQP session multiplexing links over a connection
#[async_trait]
pub trait AmqpSession: Send + Sync {
    async fn new_sender(
        &self,
        options: SenderLinkOptions,
    ) -> Result<Arc<dyn AmqpSenderLink>, TransportError>;

    async fn new_receiver(
        &self,
        options: ReceiverLinkOptions,
    ) -> Result<Arc<dyn AmqpReceiverLink>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Sending half of a link
#[async_trait]
pub trait AmqpSenderLink: Send + Sync {
    /// Send a message and wait for the remote disposition
    async fn send(&self, message: AmqpMessage) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Receiving half of a link.
///
/// Settlement identifies the delivery by the message's delivery tag.
#[async_trait]
pub trait AmqpReceiverLink: Send + Sync {
    /// Wait for the next delivery
    async fn receive(&self) -> Result<AmqpMessage, TransportError>;

    async fn accept(&self, message: &AmqpMessage) -> Result<(), TransportError>;

    async fn reject(
        &self,
        message: &AmqpMessage,
        reason: Option<RejectReason>,
    ) -> Result<(), TransportError>;

    async fn release(&self, message: &AmqpMessage) -> Result<(), TransportError>;

    /// Expiry of the session lock the attach acquired; `None` for links
    /// without a session filter
    fn session_locked_until(&self) -> Option<DateTime<Utc>> {
        None
    }

    async fn close(&self) -> Result<(), TransportError>;
}
