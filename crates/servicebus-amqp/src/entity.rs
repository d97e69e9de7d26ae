//! Management operations on one entity.
//!
//! Operations that do not fit a data link go to the entity's `$management`
//! node as request/response exchanges: lock renewal, settlement by lock
//! token, scheduling, deferred receive, peek and session state. Each
//! operation negotiates a
//! claim for the management path and opens its own request/response link
//! for the duration of the call.

use crate::amqp::{AmqpMessage, AmqpValue};
use crate::context::OperationContext;
use crate::disposition::{
    BatchDispositionIterator, Disposition, DispositionSender, DispositionStatus,
};
use crate::error::{BatchDispositionErrors, ServiceBusError, ValidationError};
use crate::link::LinkHost;
use crate::message::Message;
use crate::peek::{
    MessageListResponse, MessagePager, PeekIterator, PeekOptions, DEFAULT_PEEK_PAGE_SIZE,
};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::rpc::{RpcLink, RpcResponse};
use crate::transport::ReceiveMode;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;

const MANAGEMENT_SUFFIX: &str = "$management";
const DEAD_LETTER_SUFFIX: &str = "$DeadLetterQueue";
const TRANSFER_DEAD_LETTER_SUFFIX: &str = "$Transfer/$DeadLetterQueue";
const SUBSCRIPTIONS_SEGMENT: &str = "Subscriptions";
const MANAGEMENT_CLIENT_PREFIX: &str = "mgmt";

const OPERATION_KEY: &str = "operation";
const SERVER_TIMEOUT_KEY: &str = "com.microsoft:server-timeout";

const RENEW_LOCK_OPERATION: &str = "com.microsoft:renew-lock";
const UPDATE_DISPOSITION_OPERATION: &str = "com.microsoft:update-disposition";
const SCHEDULE_MESSAGE_OPERATION: &str = "com.microsoft:schedule-message";
const CANCEL_SCHEDULED_OPERATION: &str = "com.microsoft:cancel-scheduled-message";
const PEEK_MESSAGE_OPERATION: &str = "com.microsoft:peek-message";
const RECEIVE_BY_SEQUENCE_NUMBER_OPERATION: &str = "com.microsoft:receive-by-sequence-number";
const RENEW_SESSION_LOCK_OPERATION: &str = "com.microsoft:renew-session-lock";
const GET_SESSION_STATE_OPERATION: &str = "com.microsoft:get-session-state";
const SET_SESSION_STATE_OPERATION: &str = "com.microsoft:set-session-state";

const SEQUENCE_NUMBERS_FIELD: &str = "sequence-numbers";
const EXPIRATIONS_FIELD: &str = "expirations";
const EXPIRATION_FIELD: &str = "expiration";
const SESSION_ID_FIELD: &str = "session-id";
const SESSION_STATE_FIELD: &str = "session-state";

/// Path of the management node of `entity_path`
pub fn management_path(entity_path: &str) -> String {
    format!("{}/{}", entity_path, MANAGEMENT_SUFFIX)
}

/// Path of the dead-letter sub-queue of `entity_path`
pub fn dead_letter_path(entity_path: &str) -> String {
    format!("{}/{}", entity_path, DEAD_LETTER_SUFFIX)
}

/// Path of the transfer dead-letter sub-queue of `entity_path`
pub fn transfer_dead_letter_path(entity_path: &str) -> String {
    format!("{}/{}", entity_path, TRANSFER_DEAD_LETTER_SUFFIX)
}

/// Path of subscription `name` of `topic`
pub fn subscription_path(topic: &str, name: &str) -> String {
    format!("{}/{}/{}", topic, SUBSCRIPTIONS_SEGMENT, name)
}

/// A queue, topic or subscription addressed by its entity path
pub struct Entity {
    name: String,
    host: Arc<dyn LinkHost>,
    retry: RetryConfig,
    default_page_size: u32,
    // One renewal exchange per entity at a time
    renew_lock: Mutex<()>,
}

impl Entity {
    /// Management client for the entity at `name`
    pub fn new(name: impl Into<String>, host: Arc<dyn LinkHost>, retry: RetryConfig) -> Self {
        Self {
            name: name.into(),
            host,
            retry,
            default_page_size: DEFAULT_PEEK_PAGE_SIZE,
            renew_lock: Mutex::new(()),
        }
    }

    /// Page size for peek iterators that do not set one
    pub fn with_default_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = page_size.max(1);
        self
    }

    /// Entity path
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn management_path(&self) -> String {
        management_path(&self.name)
    }

    pub fn dead_letter_path(&self) -> String {
        dead_letter_path(&self.name)
    }

    pub fn transfer_dead_letter_path(&self) -> String {
        transfer_dead_letter_path(&self.name)
    }

    /// One request/response exchange with the management node
    async fn management_rpc(
        &self,
        ctx: &OperationContext,
        policy: &RetryPolicy,
        request: AmqpMessage,
    ) -> Result<RpcResponse, ServiceBusError> {
        let path = self.management_path();
        self.host.negotiate_claim(ctx, &path).await?;
        let session = self.host.new_session(ctx).await?;
        let link = RpcLink::open_with_prefix(ctx, session, &path, MANAGEMENT_CLIENT_PREFIX).await?;

        let result = link.retryable_rpc(ctx, policy, request).await;
        if let Err(e) = link.close(ctx).await {
            warn!(entity_path = %self.name, error = %e, "Failed to close management link");
        }
        result
    }

    /// Renew the peek-lock of every message carrying a lock token.
    ///
    /// Messages without a lock token are skipped. When none has one, nothing
    /// is sent. New lock expirations from the response are written back to
    /// the messages.
    #[instrument(skip(self, ctx, messages), fields(entity_path = %self.name))]
    pub async fn renew_locks(
        &self,
        ctx: &OperationContext,
        messages: &mut [Message],
    ) -> Result<(), ServiceBusError> {
        let mut locked = Vec::with_capacity(messages.len());
        for message in messages.iter_mut() {
            if message.lock_token.is_some() {
                locked.push(message);
            } else {
                info!(message_id = %message.id, "Message has no lock token, not renewing");
            }
        }
        if locked.is_empty() {
            info!("No lock tokens to renew");
            return Ok(());
        }

        let lock_tokens: Vec<AmqpValue> = locked
            .iter()
            .filter_map(|message| message.lock_token.map(AmqpValue::Uuid))
            .collect();
        let request = management_request(
            RENEW_LOCK_OPERATION,
            [("lock-tokens", AmqpValue::List(lock_tokens))],
        );

        let _renewing = ctx.run(async { Ok(self.renew_lock.lock().await) }).await?;
        let response = self
            .management_rpc(ctx, &self.retry.lock_renewal, request)
            .await?;
        require_ok(&response)?;

        let expirations = response
            .value()
            .and_then(AmqpValue::as_map)
            .and_then(|body| body.get(EXPIRATIONS_FIELD))
            .and_then(AmqpValue::as_list);
        if let Some(expirations) = expirations {
            for (message, expiration) in locked.into_iter().zip(expirations) {
                if let Some(locked_until) = expiration.as_timestamp() {
                    message.system_properties.locked_until = Some(locked_until);
                }
            }
        }

        debug!("Locks renewed");
        Ok(())
    }

    /// Settle a received message as completed
    pub async fn complete(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        let disposition = Disposition::new(DispositionStatus::Completed, Vec::new());
        self.settle(ctx, message, disposition).await
    }

    /// Release the lock so the message is delivered again
    pub async fn abandon(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        let disposition = Disposition::new(DispositionStatus::Abandoned, Vec::new());
        self.settle(ctx, message, disposition).await
    }

    /// Set the message aside for [`Entity::receive_deferred`]
    pub async fn defer(
        &self,
        ctx: &OperationContext,
        message: &Message,
    ) -> Result<(), ServiceBusError> {
        let disposition = Disposition::new(DispositionStatus::Deferred, Vec::new());
        self.settle(ctx, message, disposition).await
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter(
        &self,
        ctx: &OperationContext,
        message: &Message,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), ServiceBusError> {
        self.settle(ctx, message, Disposition::dead_letter(Vec::new(), reason, description))
            .await
    }

    async fn settle(
        &self,
        ctx: &OperationContext,
        message: &Message,
        mut disposition: Disposition,
    ) -> Result<(), ServiceBusError> {
        let lock_token = message.lock_token.ok_or(ServiceBusError::LockTokenMissing)?;
        disposition.lock_tokens = vec![lock_token];
        self.send_disposition(ctx, disposition).await
    }

    /// Complete every lock token, collecting per-token failures
    pub async fn complete_batch(
        &self,
        ctx: &OperationContext,
        lock_tokens: Vec<Uuid>,
    ) -> Result<(), BatchDispositionErrors> {
        BatchDispositionIterator::new(lock_tokens, DispositionStatus::Completed)
            .do_update(ctx, self)
            .await
    }

    /// Abandon every lock token, collecting per-token failures
    pub async fn abandon_batch(
        &self,
        ctx: &OperationContext,
        lock_tokens: Vec<Uuid>,
    ) -> Result<(), BatchDispositionErrors> {
        BatchDispositionIterator::new(lock_tokens, DispositionStatus::Abandoned)
            .do_update(ctx, self)
            .await
    }

    /// Schedule `messages` to appear on the entity at `enqueue_time`.
    ///
    /// Messages without an id are given one. Returns the sequence numbers to
    /// cancel them with, in message order.
    #[instrument(
        skip(self, ctx, messages),
        fields(entity_path = %self.name, count = messages.len())
    )]
    pub async fn schedule_messages(
        &self,
        ctx: &OperationContext,
        enqueue_time: DateTime<Utc>,
        messages: &mut [Message],
    ) -> Result<Vec<i64>, ServiceBusError> {
        if messages.is_empty() {
            return Err(ValidationError::Required {
                field: "messages".to_string(),
            }
            .into());
        }

        let codec = self.host.codec();
        let mut entries = Vec::with_capacity(messages.len());
        for message in messages.iter_mut() {
            if message.id.is_empty() {
                message.id = Uuid::new_v4().to_string();
            }
            message.system_properties.scheduled_enqueue_time = Some(enqueue_time);
            let encoded = codec.encode(&message.to_amqp())?;

            let mut entry = HashMap::new();
            entry.insert("message-id".to_string(), AmqpValue::from(message.id.clone()));
            entry.insert("message".to_string(), AmqpValue::Binary(encoded));
            if let Some(group_id) = &message.group_id {
                entry.insert("session-id".to_string(), AmqpValue::from(group_id.clone()));
            }
            if let Some(partition_key) = &message.system_properties.partition_key {
                entry.insert("partition-key".to_string(), AmqpValue::from(partition_key.clone()));
            }
            if let Some(via) = &message.system_properties.via_partition_key {
                entry.insert("via-partition-key".to_string(), AmqpValue::from(via.clone()));
            }
            entries.push(AmqpValue::Map(entry));
        }

        let mut request = management_request(
            SCHEDULE_MESSAGE_OPERATION,
            [("messages", AmqpValue::List(entries))],
        );
        attach_server_timeout(&mut request, ctx);

        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        require_ok(&response)?;
        let sequence_numbers = decode_sequence_numbers(response.value())?;

        info!(scheduled = sequence_numbers.len(), "Messages scheduled");
        Ok(sequence_numbers)
    }

    /// Cancel scheduled messages by the sequence numbers scheduling returned
    #[instrument(skip(self, ctx, sequence_numbers), fields(entity_path = %self.name))]
    pub async fn cancel_scheduled(
        &self,
        ctx: &OperationContext,
        sequence_numbers: &[i64],
    ) -> Result<(), ServiceBusError> {
        if sequence_numbers.is_empty() {
            debug!("No scheduled messages to cancel");
            return Ok(());
        }

        let mut request = management_request(
            CANCEL_SCHEDULED_OPERATION,
            [(SEQUENCE_NUMBERS_FIELD, sequence_number_list(sequence_numbers))],
        );
        attach_server_timeout(&mut request, ctx);

        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        require_ok(&response)
    }

    /// Receive deferred messages by sequence number.
    ///
    /// In peek-lock mode the messages come back locked and must be settled
    /// with [`Entity::complete`] or another disposition.
    #[instrument(skip(self, ctx, sequence_numbers), fields(entity_path = %self.name))]
    pub async fn receive_deferred(
        &self,
        ctx: &OperationContext,
        mode: ReceiveMode,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, ServiceBusError> {
        let request = management_request(
            RECEIVE_BY_SEQUENCE_NUMBER_OPERATION,
            [
                (SEQUENCE_NUMBERS_FIELD, sequence_number_list(sequence_numbers)),
                ("receiver-settle-mode", AmqpValue::UInt(mode.settle_mode_code())),
            ],
        );

        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        if response.code == 204 {
            return Err(ServiceBusError::NoMessages);
        }

        let codec = self.host.codec();
        MessageListResponse::decode(response.value())?.into_messages(codec.as_ref())
    }

    /// Renew the lock on messaging session `session_id`, returning its new
    /// expiry
    #[instrument(skip(self, ctx), fields(entity_path = %self.name))]
    pub async fn renew_session_lock(
        &self,
        ctx: &OperationContext,
        session_id: &str,
    ) -> Result<DateTime<Utc>, ServiceBusError> {
        let request = management_request(
            RENEW_SESSION_LOCK_OPERATION,
            [(SESSION_ID_FIELD, AmqpValue::from(session_id))],
        );
        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        require_ok(&response)?;

        let body = response_map(response.value())?;
        let expiration = body
            .get(EXPIRATION_FIELD)
            .ok_or_else(|| ServiceBusError::missing_field(EXPIRATION_FIELD))?;
        let locked_until = expiration.as_timestamp().ok_or_else(|| {
            ServiceBusError::incorrect_type(EXPIRATION_FIELD, "timestamp", expiration.type_name())
        })?;

        debug!(session_id, locked_until = %locked_until, "Session lock renewed");
        Ok(locked_until)
    }

    /// State stored with messaging session `session_id`; `None` when unset
    #[instrument(skip(self, ctx), fields(entity_path = %self.name))]
    pub async fn session_state(
        &self,
        ctx: &OperationContext,
        session_id: &str,
    ) -> Result<Option<Bytes>, ServiceBusError> {
        let request = management_request(
            GET_SESSION_STATE_OPERATION,
            [(SESSION_ID_FIELD, AmqpValue::from(session_id))],
        );
        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        require_ok(&response)?;

        match response_map(response.value())?.get(SESSION_STATE_FIELD) {
            None => Ok(None),
            Some(AmqpValue::Binary(state)) => Ok(Some(state.clone())),
            Some(other) => Err(ServiceBusError::incorrect_type(
                SESSION_STATE_FIELD,
                "binary",
                other.type_name(),
            )),
        }
    }

    /// Replace the state stored with messaging session `session_id`
    #[instrument(skip(self, ctx, state), fields(entity_path = %self.name, len = state.len()))]
    pub async fn set_session_state(
        &self,
        ctx: &OperationContext,
        session_id: &str,
        state: Bytes,
    ) -> Result<(), ServiceBusError> {
        let request = management_request(
            SET_SESSION_STATE_OPERATION,
            [
                (SESSION_ID_FIELD, AmqpValue::from(session_id)),
                (SESSION_STATE_FIELD, AmqpValue::Binary(state)),
            ],
        );
        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        require_ok(&response)
    }

    /// Browse the entity from the head, or from the options' sequence number
    pub fn peek(&self, options: PeekOptions) -> Result<PeekIterator<'_>, ServiceBusError> {
        PeekIterator::new(self, options, self.default_page_size)
    }

    /// Peek a single message.
    ///
    /// Forces a page size of one, so options that already set a page size
    /// are rejected.
    pub async fn peek_one(
        &self,
        ctx: &OperationContext,
        options: PeekOptions,
    ) -> Result<Message, ServiceBusError> {
        let mut iterator = self.peek(options.with_page_size(1))?;
        iterator.next(ctx).await
    }

    /// Up to `count` messages from `from_sequence_number`, in the order the
    /// service returned them
    #[instrument(skip(self, ctx), fields(entity_path = %self.name))]
    pub async fn peek_messages(
        &self,
        ctx: &OperationContext,
        from_sequence_number: i64,
        count: u32,
    ) -> Result<Vec<AmqpMessage>, ServiceBusError> {
        let message_count = i32::try_from(count).unwrap_or(i32::MAX);
        let mut request = management_request(
            PEEK_MESSAGE_OPERATION,
            [
                ("from-sequence-number", AmqpValue::Long(from_sequence_number)),
                ("message-count", AmqpValue::Int(message_count)),
            ],
        );
        attach_server_timeout(&mut request, ctx);

        let response = self
            .management_rpc(ctx, &self.retry.management, request)
            .await?;
        if response.code == 204 {
            return Ok(Vec::new());
        }

        let codec = self.host.codec();
        MessageListResponse::decode(response.value())?
            .entries
            .into_iter()
            .map(|entry| codec.decode(&entry.message).map_err(ServiceBusError::from))
            .collect()
    }
}

#[async_trait]
impl DispositionSender for Entity {
    #[instrument(
        skip(self, ctx, disposition),
        fields(entity_path = %self.name, status = %disposition.status)
    )]
    async fn send_disposition(
        &self,
        ctx: &OperationContext,
        disposition: Disposition,
    ) -> Result<(), ServiceBusError> {
        if disposition.lock_tokens.is_empty() {
            return Err(ServiceBusError::LockTokenMissing);
        }

        let tokens = disposition
            .lock_tokens
            .iter()
            .copied()
            .map(AmqpValue::Uuid)
            .collect();
        let mut body = HashMap::new();
        body.insert(
            "disposition-status".to_string(),
            AmqpValue::from(disposition.status.as_str()),
        );
        body.insert("lock-tokens".to_string(), AmqpValue::List(tokens));
        if let Some(reason) = disposition.dead_letter_reason {
            body.insert("deadletter-reason".to_string(), AmqpValue::from(reason));
        }
        if let Some(description) = disposition.dead_letter_description {
            body.insert("deadletter-description".to_string(), AmqpValue::from(description));
        }

        let request = AmqpMessage::with_value(body)
            .with_application_property(OPERATION_KEY, UPDATE_DISPOSITION_OPERATION);
        self.management_rpc(ctx, &self.retry.management, request)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MessagePager for Entity {
    async fn peek_page(
        &self,
        ctx: &OperationContext,
        from_sequence_number: i64,
        count: u32,
    ) -> Result<Vec<AmqpMessage>, ServiceBusError> {
        self.peek_messages(ctx, from_sequence_number, count).await
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}

// ============================================================================
// Request and response helpers
// ============================================================================

fn management_request<const N: usize>(
    operation: &str,
    fields: [(&str, AmqpValue); N],
) -> AmqpMessage {
    let body: HashMap<String, AmqpValue> = fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    AmqpMessage::with_value(body).with_application_property(OPERATION_KEY, operation)
}

/// Tell the service how long the caller is still waiting
fn attach_server_timeout(request: &mut AmqpMessage, ctx: &OperationContext) {
    if let Some(remaining) = ctx.remaining() {
        let millis = u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX);
        request
            .application_properties
            .insert(SERVER_TIMEOUT_KEY.to_string(), AmqpValue::UInt(millis));
    }
}

fn sequence_number_list(sequence_numbers: &[i64]) -> AmqpValue {
    AmqpValue::List(sequence_numbers.iter().copied().map(AmqpValue::Long).collect())
}

/// Some operations report success only as 200
fn require_ok(response: &RpcResponse) -> Result<(), ServiceBusError> {
    if response.code == 200 {
        return Ok(());
    }
    Err(ServiceBusError::Rpc {
        code: response.code,
        description: response.description().to_string(),
    })
}

fn response_map(
    value: Option<&AmqpValue>,
) -> Result<&HashMap<String, AmqpValue>, ServiceBusError> {
    match value {
        Some(AmqpValue::Map(body)) => Ok(body),
        Some(other) => Err(ServiceBusError::incorrect_type("value", "map", other.type_name())),
        None => Err(ServiceBusError::incorrect_type("value", "map", "null")),
    }
}

fn decode_sequence_numbers(value: Option<&AmqpValue>) -> Result<Vec<i64>, ServiceBusError> {
    let body = response_map(value)?;

    let numbers = body
        .get(SEQUENCE_NUMBERS_FIELD)
        .ok_or_else(|| ServiceBusError::missing_field(SEQUENCE_NUMBERS_FIELD))?;
    let numbers = numbers.as_list().ok_or_else(|| {
        ServiceBusError::incorrect_type(SEQUENCE_NUMBERS_FIELD, "list", numbers.type_name())
    })?;

    numbers
        .iter()
        .map(|number| {
            number.as_i64().ok_or_else(|| {
                ServiceBusError::incorrect_type(SEQUENCE_NUMBERS_FIELD, "long", number.type_name())
            })
        })
        .collect()
}
