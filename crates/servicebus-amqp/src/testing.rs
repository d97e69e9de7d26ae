//! Test doubles shared by the unit tests.

use crate::amqp::MessageCodec;
use crate::context::OperationContext;
use crate::error::ServiceBusError;
use crate::link::{ClaimNegotiator, SessionFactory};
use crate::transport::{AmqpConnection, AmqpSession};
use crate::transports::{InMemoryBroker, InMemoryConnection};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Link host over an in-memory connection that records every claim
pub(crate) struct StubHost {
    connection: InMemoryConnection,
    claims: Mutex<Vec<String>>,
    claim_failures: Mutex<VecDeque<ServiceBusError>>,
}

impl StubHost {
    pub(crate) fn new(broker: &InMemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            connection: broker.connect(),
            claims: Mutex::new(Vec::new()),
            claim_failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Entity paths claims were negotiated for, in order
    pub(crate) fn claims(&self) -> Vec<String> {
        self.claims.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_claim(&self, error: ServiceBusError) {
        self.claim_failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl ClaimNegotiator for StubHost {
    async fn negotiate_claim(
        &self,
        ctx: &OperationContext,
        entity_path: &str,
    ) -> Result<(), ServiceBusError> {
        ctx.check()?;
        self.claims.lock().unwrap().push(entity_path.to_string());
        match self.claim_failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionFactory for StubHost {
    async fn new_session(
        &self,
        _ctx: &OperationContext,
    ) -> Result<Box<dyn AmqpSession>, ServiceBusError> {
        Ok(self.connection.new_session().await?)
    }

    fn codec(&self) -> Arc<dyn MessageCodec> {
        self.connection.codec()
    }
}
