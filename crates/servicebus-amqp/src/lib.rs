//! # Service Bus AMQP
//!
//! Link layer for Azure Service Bus over AMQP 1.0.
//!
//! This library provides:
//! - Claims-based security negotiation on the `$cbs` node, with periodic renewal
//! - Sender and receiver links with explicit recovery
//! - Message batching into single batch envelopes
//! - Continuous and one-shot receiving with automatic settlement
//! - Lock renewal, dispositions, scheduling and deferred receive over the
//!   entity's `$management` node
//! - Peeking in sequence number order
//! - Topics and their subscriptions
//! - Session receivers holding and renewing a session lock
//!
//! The AMQP protocol engine is not part of this crate. It is reached through
//! the traits in [`transport`]; [`transports::InMemoryBroker`] implements them
//! for tests and development.
//!
//! ## Module Organization
//!
//! - [`namespace`], [`queue`], [`topic`], [`subscription`] - entry points owning
//!   connections and links
//! - [`sender`], [`receiver`], [`session_receiver`], [`batch`] - data links
//! - [`entity`], [`disposition`], [`peek`] - management operations
//! - [`cbs`], [`rpc`], [`link`], [`session`] - link plumbing
//! - [`amqp`], [`message`], [`transport`], [`transports`] - message model and transport seam
//! - [`config`], [`context`], [`error`], [`retry`], [`auth`] - supporting types
//!
//! ## Example
//!
//! ```rust
//! use servicebus_amqp::{
//!     InMemoryBroker, Message, Namespace, OperationContext, QueueOptions, SendOptions,
//!     ServiceBusConfig, StaticTokenProvider, Token, TokenType,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let ctx = OperationContext::background();
//! let broker = InMemoryBroker::new();
//! let token = Token::new(TokenType::Jwt, "token", chrono::Utc::now());
//! let namespace = Namespace::connect(
//!     &ctx,
//!     ServiceBusConfig::new("contoso"),
//!     &broker,
//!     Arc::new(StaticTokenProvider::new(token)),
//! )
//! .await
//! .unwrap();
//!
//! let queue = namespace.queue("orders", QueueOptions::new());
//! queue.send(&ctx, Message::new("hello"), SendOptions::new()).await.unwrap();
//! assert_eq!(broker.pending("orders"), 1);
//!
//! queue.close(&ctx).await.unwrap();
//! namespace.close(&ctx).await.unwrap();
//! # });
//! ```

pub mod amqp;
pub mod auth;
pub mod batch;
pub mod cbs;
pub mod config;
pub mod context;
pub mod disposition;
pub mod entity;
pub mod error;
pub mod link;
pub mod message;
pub mod namespace;
pub mod peek;
pub mod queue;
pub mod receiver;
pub mod retry;
pub mod rpc;
pub mod sender;
pub mod session;
pub mod session_receiver;
pub mod subscription;
pub mod topic;
pub mod transport;
pub mod transports;

mod slot;
#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use amqp::{AmqpMessage, AmqpValue, JsonMessageCodec, MessageCodec};
pub use auth::{StaticTokenProvider, Token, TokenProvider, TokenType};
pub use batch::{BatchIterator, MessageBatch};
pub use config::ServiceBusConfig;
pub use context::OperationContext;
pub use disposition::{BatchDispositionIterator, Disposition, DispositionStatus};
pub use entity::Entity;
pub use error::{
    BatchDispositionErrors, CodecError, ConfigurationError, ServiceBusError, TransportError,
    ValidationError,
};
pub use message::{Message, SendOptions, SystemProperties};
pub use namespace::Namespace;
pub use peek::{PeekIterator, PeekOptions};
pub use queue::{Queue, QueueOptions};
pub use receiver::{
    Handler, HandlerFunc, ListenerHandle, MessageReceiver, Receiver, ReceiverOptions,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use sender::{MessageSender, Sender, SenderOptions};
pub use session_receiver::SessionReceiver;
pub use subscription::{Subscription, SubscriptionOptions};
pub use topic::Topic;
pub use transport::ReceiveMode;
pub use transports::InMemoryBroker;
