//! Capabilities a Sender or Receiver needs from its namespace.
//!
//! Links hold these narrow traits instead of the concrete
//! [`Namespace`](crate::namespace::Namespace), so tests can supply a stub host.

use crate::amqp::MessageCodec;
use crate::context::OperationContext;
use crate::error::ServiceBusError;
use crate::transport::AmqpSession;
use async_trait::async_trait;
use std::sync::Arc;

/// Authorizes operations on an entity path
#[async_trait]
pub trait ClaimNegotiator: Send + Sync {
    /// Ensure the caller holds a valid claim for `entity_path`
    async fn negotiate_claim(
        &self,
        ctx: &OperationContext,
        entity_path: &str,
    ) -> Result<(), ServiceBusError>;
}

/// Opens transport sessions on the namespace connection
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn new_session(
        &self,
        ctx: &OperationContext,
    ) -> Result<Box<dyn AmqpSession>, ServiceBusError>;

    /// Codec of the underlying connection
    fn codec(&self) -> Arc<dyn MessageCodec>;
}

/// Everything needed to build and rebuild a link
pub trait LinkHost: ClaimNegotiator + SessionFactory {}

impl<T> LinkHost for T where T: ClaimNegotiator + SessionFactory + ?Sized {}
