//! Request/response exchanges over a dedicated sender and receiver pair.
//!
//! Both the `$cbs` claims node and the per-entity `$management` node follow
//! the same pattern: the request names a client `reply-to` address, the reply
//! arrives on a receiver attached with that address as its target, and the
//! reply's correlation id is the request's message id.

use crate::amqp::{AmqpMessage, AmqpValue};
use crate::context::OperationContext;
use crate::error::ServiceBusError;
use crate::retry::{retry, RetryPolicy};
use crate::transport::{
    AmqpReceiverLink, AmqpSenderLink, AmqpSession, ReceiverLinkOptions, SenderLinkOptions,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;

const STATUS_CODE_KEYS: [&str; 2] = ["status-code", "statusCode"];
const STATUS_DESCRIPTION_KEYS: [&str; 2] = ["status-description", "statusDescription"];

/// Decoded reply of a request/response exchange
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub code: i32,
    pub description: Option<String>,
    pub message: AmqpMessage,
}

impl RpcResponse {
    /// Read the status fields of a reply.
    ///
    /// Accepts both the hyphenated and the camel case spelling of the keys.
    /// A missing status code is a [`ServiceBusError::MissingField`], values of
    /// the wrong type are [`ServiceBusError::IncorrectType`].
    pub fn decode(message: AmqpMessage) -> Result<Self, ServiceBusError> {
        let (code_key, code_value) = find_property(&message, &STATUS_CODE_KEYS)
            .ok_or_else(|| ServiceBusError::missing_field(STATUS_CODE_KEYS[0]))?;
        let code = code_value
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(|| {
                ServiceBusError::incorrect_type(code_key, "int", code_value.type_name())
            })?;

        let description = match find_property(&message, &STATUS_DESCRIPTION_KEYS) {
            None => None,
            Some((key, value)) => Some(
                value
                    .as_str()
                    .ok_or_else(|| {
                        ServiceBusError::incorrect_type(key, "string", value.type_name())
                    })?
                    .to_string(),
            ),
        };

        Ok(Self {
            code,
            description,
            message,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Body value of the reply
    pub fn value(&self) -> Option<&AmqpValue> {
        self.message.value.as_ref()
    }
}

fn find_property<'a>(
    message: &'a AmqpMessage,
    keys: &[&'static str],
) -> Option<(&'static str, &'a AmqpValue)> {
    keys.iter()
        .find_map(|key| message.application_property(key).map(|value| (*key, value)))
}

/// Sender and receiver pair bound to one request/response node
pub struct RpcLink {
    address: String,
    client_address: String,
    session: Box<dyn AmqpSession>,
    sender: Arc<dyn AmqpSenderLink>,
    receiver: Arc<dyn AmqpReceiverLink>,
    // One outstanding request at a time keeps reply matching trivial.
    request_lock: Mutex<()>,
}

impl RpcLink {
    /// Attach to `address` on a session owned by the new link.
    ///
    /// The session is closed again if either link fails to attach.
    #[instrument(skip(ctx, session))]
    pub async fn open(
        ctx: &OperationContext,
        session: Box<dyn AmqpSession>,
        address: &str,
        client_address: &str,
    ) -> Result<Self, ServiceBusError> {
        let attached = ctx
            .run(async {
                let sender = session
                    .new_sender(SenderLinkOptions {
                        target: address.to_string(),
                        name: Some(format!("{}-sender", client_address)),
                    })
                    .await
                    .map_err(ServiceBusError::from)?;
                let receiver = session
                    .new_receiver(ReceiverLinkOptions {
                        target: Some(client_address.to_string()),
                        name: Some(format!("{}-receiver", client_address)),
                        ..ReceiverLinkOptions::new(address)
                    })
                    .await
                    .map_err(ServiceBusError::from)?;
                Ok::<_, ServiceBusError>((sender, receiver))
            })
            .await;

        match attached {
            Ok((sender, receiver)) => {
                debug!(address, client_address, "Request/response link attached");
                Ok(Self {
                    address: address.to_string(),
                    client_address: client_address.to_string(),
                    session,
                    sender,
                    receiver,
                    request_lock: Mutex::new(()),
                })
            }
            Err(error) => {
                if let Err(close_error) = session.close().await {
                    warn!(
                        address,
                        error = %close_error,
                        "Failed to close session after attach failure"
                    );
                }
                Err(error)
            }
        }
    }

    /// Attach to `address` with a generated client address
    pub async fn open_with_prefix(
        ctx: &OperationContext,
        session: Box<dyn AmqpSession>,
        address: &str,
        client_prefix: &str,
    ) -> Result<Self, ServiceBusError> {
        let client_address = format!("{}-{}", client_prefix, Uuid::new_v4());
        Self::open(ctx, session, address, &client_address).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    /// Send one request and wait for its correlated reply.
    ///
    /// Replies with another correlation id are settled and skipped. The
    /// status code is decoded but not judged; see [`Self::retryable_rpc`].
    #[instrument(skip(self, ctx, message), fields(address = %self.address))]
    pub async fn rpc(
        &self,
        ctx: &OperationContext,
        mut message: AmqpMessage,
    ) -> Result<RpcResponse, ServiceBusError> {
        let _request = ctx.run(async { Ok(self.request_lock.lock().await) }).await?;

        let message_id = Uuid::new_v4().to_string();
        message.properties.message_id = Some(message_id.clone());
        message.properties.reply_to = Some(self.client_address.clone());

        ctx.run(async { self.sender.send(message).await.map_err(ServiceBusError::from) })
            .await?;

        loop {
            let reply = ctx
                .run(async { self.receiver.receive().await.map_err(ServiceBusError::from) })
                .await?;
            ctx.run(async { self.receiver.accept(&reply).await.map_err(ServiceBusError::from) })
                .await?;

            if reply.properties.correlation_id.as_deref() == Some(message_id.as_str()) {
                return RpcResponse::decode(reply);
            }
            debug!(
                correlation_id = ?reply.properties.correlation_id,
                "Skipping reply for another request"
            );
        }
    }

    /// [`Self::rpc`] under a retry policy.
    ///
    /// 2xx replies succeed. Other codes become [`ServiceBusError::Rpc`], which
    /// is retried when the code is 500 or above.
    pub async fn retryable_rpc(
        &self,
        ctx: &OperationContext,
        policy: &RetryPolicy,
        message: AmqpMessage,
    ) -> Result<RpcResponse, ServiceBusError> {
        retry(ctx, policy, |_| {
            let message = message.clone();
            async move {
                let response = self.rpc(ctx, message).await?;
                if response.is_success() {
                    return Ok(response);
                }
                Err(ServiceBusError::Rpc {
                    code: response.code,
                    description: response.description().to_string(),
                })
            }
        })
        .await
    }

    /// Close sender, receiver and session, in that order.
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let sender = ctx
            .run(async { self.sender.close().await.map_err(ServiceBusError::from) })
            .await;
        let receiver = ctx
            .run(async { self.receiver.close().await.map_err(ServiceBusError::from) })
            .await;
        let session = ctx
            .run(async { self.session.close().await.map_err(ServiceBusError::from) })
            .await;
        sender.and(receiver).and(session)
    }
}

impl std::fmt::Debug for RpcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcLink")
            .field("address", &self.address)
            .field("client_address", &self.client_address)
            .finish()
    }
}
