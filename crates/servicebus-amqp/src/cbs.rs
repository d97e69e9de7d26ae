//! Claims-based security over the `$cbs` node.
//!
//! A claim authorizes the connection to operate on one entity path. It is
//! obtained by sending a `put-token` request carrying a bearer token for the
//! entity's resource URI, and it expires with the token, so linked senders and
//! receivers keep it alive with a [`ClaimRefresher`].

use crate::amqp::AmqpMessage;
use crate::auth::Token;
use crate::context::OperationContext;
use crate::error::ServiceBusError;
use crate::link::ClaimNegotiator;
use crate::rpc::RpcLink;
use crate::transport::AmqpSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "cbs_tests.rs"]
mod tests;

/// Address of the claims node
pub const CBS_ADDRESS: &str = "$cbs";

const CBS_CLIENT_PREFIX: &str = "cbs";
const PUT_TOKEN_OPERATION: &str = "put-token";
const STATUS_DESCRIPTION_KEY: &str = "status-description";

/// Request/response link to the claims node.
///
/// The node serves one request at a time; callers serialize access.
#[derive(Debug)]
pub struct CbsLink {
    link: RpcLink,
}

impl CbsLink {
    /// Attach to `$cbs` on a dedicated session
    pub async fn open(
        ctx: &OperationContext,
        session: Box<dyn AmqpSession>,
    ) -> Result<Self, ServiceBusError> {
        let link = RpcLink::open_with_prefix(ctx, session, CBS_ADDRESS, CBS_CLIENT_PREFIX).await?;
        Ok(Self { link })
    }

    pub fn client_address(&self) -> &str {
        self.link.client_address()
    }

    /// Put `token` for `audience` and judge the reply.
    ///
    /// 2xx succeeds. Any other code is [`ServiceBusError::ClaimRejected`],
    /// retryable only from 500 up. Missing or mistyped status fields are
    /// [`ServiceBusError::MalformedClaimsResponse`].
    #[instrument(skip(self, ctx, token), fields(token_type = %token.token_type))]
    pub async fn negotiate(
        &self,
        ctx: &OperationContext,
        audience: &str,
        token: &Token,
    ) -> Result<(), ServiceBusError> {
        let request = AmqpMessage::with_value(token.token.clone())
            .with_application_property("operation", PUT_TOKEN_OPERATION)
            .with_application_property("type", token.token_type.as_str())
            .with_application_property("name", audience)
            .with_application_property("expiration", token.expiry.clone());

        let response = match self.link.rpc(ctx, request).await {
            Ok(response) => response,
            Err(ServiceBusError::MissingField { field }) => {
                return Err(ServiceBusError::MalformedClaimsResponse {
                    message: format!("reply has no '{}'", field),
                });
            }
            Err(ServiceBusError::IncorrectType {
                field,
                expected,
                actual,
            }) => {
                return Err(ServiceBusError::MalformedClaimsResponse {
                    message: format!("'{}' is {}, expected {}", field, actual, expected),
                });
            }
            Err(error) => return Err(error),
        };

        let description = response.description.clone().ok_or_else(|| {
            ServiceBusError::MalformedClaimsResponse {
                message: format!("reply has no '{}'", STATUS_DESCRIPTION_KEY),
            }
        })?;

        if response.is_success() {
            debug!(audience, code = response.code, "Claim accepted");
            return Ok(());
        }

        Err(ServiceBusError::ClaimRejected {
            audience: audience.to_string(),
            status_code: response.code,
            description,
        })
    }

    pub async fn close(&self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        self.link.close(ctx).await
    }
}

/// Background task renewing the claim for one entity path.
///
/// The task stops when the refresher is dropped.
pub struct ClaimRefresher {
    entity_path: String,
    _guard: DropGuard,
}

impl ClaimRefresher {
    /// Re-negotiate the claim for `entity_path` every `interval`, starting one
    /// interval from now
    pub fn start<N>(negotiator: Arc<N>, entity_path: impl Into<String>, interval: Duration) -> Self
    where
        N: ClaimNegotiator + ?Sized + 'static,
    {
        let entity_path = entity_path.into();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_path = entity_path.clone();

        tokio::spawn(async move {
            let ctx = OperationContext::with_cancellation(task_token.clone());
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match negotiator.negotiate_claim(&ctx, &task_path).await {
                    Ok(()) => debug!(entity_path = %task_path, "Claim refreshed"),
                    Err(ServiceBusError::Cancelled) => break,
                    Err(e) => warn!(
                        entity_path = %task_path,
                        error = %e,
                        "Claim refresh failed, will try again next interval"
                    ),
                }
            }

            debug!(entity_path = %task_path, "Claim refresher stopped");
        });

        Self {
            entity_path,
            _guard: token.drop_guard(),
        }
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }
}

impl std::fmt::Debug for ClaimRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimRefresher")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}
