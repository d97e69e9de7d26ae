//! Browsing an entity without locking or settling messages.
//!
//! Peeked messages are fetched in pages from the management node. Each page
//! is sorted by sequence number before it is buffered, and the next page
//! starts one past the highest sequence number seen so far.

use crate::amqp::{AmqpMessage, AmqpValue, MessageCodec};
use crate::context::OperationContext;
use crate::error::{ServiceBusError, ValidationError};
use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "peek_tests.rs"]
mod tests;

/// Messages fetched per page unless configured otherwise
pub const DEFAULT_PEEK_PAGE_SIZE: u32 = 10;

const MESSAGES_FIELD: &str = "messages";
const MESSAGE_FIELD: &str = "message";
const LOCK_TOKEN_FIELD: &str = "lock-token";

/// Options for a peek iterator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeekOptions {
    page_size: Option<u32>,
    page_size_repeated: bool,
    from_sequence_number: Option<i64>,
}

impl PeekOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages requested per page; must be at least 1 and may be set once
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        if self.page_size.is_some() {
            self.page_size_repeated = true;
        }
        self.page_size = Some(page_size);
        self
    }

    /// Start browsing at `sequence_number` instead of the head of the entity
    pub fn from_sequence_number(mut self, sequence_number: i64) -> Self {
        self.from_sequence_number = Some(sequence_number);
        self
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    fn validate(&self) -> Result<(), ServiceBusError> {
        if self.page_size_repeated {
            return Err(ValidationError::InvalidFormat {
                field: "page_size".to_string(),
                message: "page size has already been set".to_string(),
            }
            .into());
        }
        if self.page_size == Some(0) {
            return Err(ValidationError::OutOfRange {
                field: "page_size".to_string(),
                message: "page size must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// One entry of a message list response
#[derive(Debug, Clone, PartialEq)]
pub struct MessageListEntry {
    /// Encoded transport message
    pub message: Bytes,
    /// Lock token, present on deferred messages received in peek-lock mode
    pub lock_token: Option<Uuid>,
}

/// Body of a peek or receive-by-sequence-number response:
/// `{"messages": [{"message": <binary>}, ...]}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageListResponse {
    pub entries: Vec<MessageListEntry>,
}

impl MessageListResponse {
    /// Validate each nesting level of the response body
    pub fn decode(value: Option<&AmqpValue>) -> Result<Self, ServiceBusError> {
        let body = match value {
            Some(AmqpValue::Map(body)) => body,
            Some(other) => {
                return Err(ServiceBusError::incorrect_type("value", "map", other.type_name()))
            }
            None => return Err(ServiceBusError::incorrect_type("value", "map", "null")),
        };

        let messages = body
            .get(MESSAGES_FIELD)
            .ok_or_else(|| ServiceBusError::missing_field(MESSAGES_FIELD))?;
        let messages = messages.as_list().ok_or_else(|| {
            ServiceBusError::incorrect_type(MESSAGES_FIELD, "list", messages.type_name())
        })?;

        let mut entries = Vec::with_capacity(messages.len());
        for raw in messages {
            let entry = raw.as_map().ok_or_else(|| {
                ServiceBusError::incorrect_type(MESSAGE_FIELD, "map", raw.type_name())
            })?;
            let payload = entry
                .get(MESSAGE_FIELD)
                .ok_or_else(|| ServiceBusError::missing_field(MESSAGE_FIELD))?;
            let message = payload
                .as_bytes()
                .cloned()
                .ok_or_else(|| ServiceBusError::MalformedMessage {
                    message: format!(
                        "'{}' is {}, expected binary",
                        MESSAGE_FIELD,
                        payload.type_name()
                    ),
                })?;

            entries.push(MessageListEntry {
                message,
                lock_token: entry.get(LOCK_TOKEN_FIELD).and_then(AmqpValue::as_uuid),
            });
        }

        Ok(Self { entries })
    }

    /// Decode every entry into a message
    pub fn into_messages(self, codec: &dyn MessageCodec) -> Result<Vec<Message>, ServiceBusError> {
        self.entries
            .into_iter()
            .map(|entry| -> Result<Message, ServiceBusError> {
                let mut message = Message::from_amqp(codec.decode(&entry.message)?);
                if entry.lock_token.is_some() {
                    message.lock_token = entry.lock_token;
                }
                Ok(message)
            })
            .collect()
    }
}

/// Source of peeked pages
#[async_trait]
pub trait MessagePager: Send + Sync {
    /// Up to `count` messages starting at `from_sequence_number`; empty
    /// when nothing is available
    async fn peek_page(
        &self,
        ctx: &OperationContext,
        from_sequence_number: i64,
        count: u32,
    ) -> Result<Vec<AmqpMessage>, ServiceBusError>;
}

/// Buffered reader over peeked pages, in ascending sequence number order
pub struct PeekIterator<'a> {
    pager: &'a dyn MessagePager,
    page_size: u32,
    last_sequence_number: i64,
    buffer: VecDeque<Message>,
}

impl<'a> PeekIterator<'a> {
    /// Iterator over `pager` using `default_page_size` unless the options set one
    pub fn new(
        pager: &'a dyn MessagePager,
        options: PeekOptions,
        default_page_size: u32,
    ) -> Result<Self, ServiceBusError> {
        options.validate()?;
        let page_size = options.page_size.unwrap_or(default_page_size).max(1);

        Ok(Self {
            pager,
            page_size,
            last_sequence_number: options.from_sequence_number.unwrap_or(0),
            buffer: VecDeque::with_capacity(page_size as usize),
        })
    }

    /// Peeking never finishes; an exhausted entity yields
    /// [`ServiceBusError::NoMessages`] until more messages arrive
    pub fn is_done(&self) -> bool {
        false
    }

    /// Sequence number the next page starts at
    pub fn last_sequence_number(&self) -> i64 {
        self.last_sequence_number
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Next message, fetching a page when the buffer is empty
    pub async fn next(&mut self, ctx: &OperationContext) -> Result<Message, ServiceBusError> {
        if self.buffer.is_empty() {
            self.fetch_page(ctx).await?;
        }
        self.buffer.pop_front().ok_or(ServiceBusError::NoMessages)
    }

    async fn fetch_page(&mut self, ctx: &OperationContext) -> Result<(), ServiceBusError> {
        let page = self
            .pager
            .peek_page(ctx, self.last_sequence_number, self.page_size)
            .await?;

        let mut messages: Vec<Message> = page.into_iter().map(Message::from_amqp).collect();
        messages.sort_by_key(|message| message.system_properties.sequence_number);

        if let Some(highest) = messages
            .iter()
            .filter_map(|message| message.system_properties.sequence_number)
            .max()
        {
            self.last_sequence_number = self.last_sequence_number.max(highest + 1);
        }

        debug!(
            messages = messages.len(),
            next_sequence_number = self.last_sequence_number,
            "Fetched peek page"
        );
        self.buffer.extend(messages);
        Ok(())
    }
}

impl std::fmt::Debug for PeekIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeekIterator")
            .field("page_size", &self.page_size)
            .field("last_sequence_number", &self.last_sequence_number)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
