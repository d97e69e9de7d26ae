//! Size-bounded message batches.
//!
//! A batch travels as one transport message in the batch format, each data
//! section holding one encoded sub-message. Every batch reserves a fixed
//! wrapper overhead and charges each sub-message its encoded length plus a
//! per-message overhead, so a batch never grows past its maximum size.

use crate::amqp::{AmqpMessage, MessageCodec, BATCH_MESSAGE_FORMAT};
use crate::error::ServiceBusError;
use crate::message::Message;
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;

/// Bytes reserved for the batch envelope
pub const BATCH_WRAPPER_OVERHEAD: usize = 100;

/// Bytes charged per sub-message on top of its encoded length
pub const BATCH_MESSAGE_OVERHEAD: usize = 5;

/// Sub-messages sent together as one envelope
#[derive(Debug, Clone)]
pub struct MessageBatch {
    id: String,
    max_size: usize,
    size: usize,
    sections: Vec<Bytes>,
    codec: Arc<dyn MessageCodec>,
}

impl MessageBatch {
    /// Empty batch charged only the envelope overhead
    pub fn new(max_size: usize, id: impl Into<String>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            id: id.into(),
            max_size,
            size: BATCH_WRAPPER_OVERHEAD,
            sections: Vec::new(),
            codec,
        }
    }

    /// Message id of the envelope, and of sub-messages without one
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Size limit in bytes
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes charged so far, wrapper overhead included
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of sub-messages
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Add `message` if it fits.
    ///
    /// Returns `Ok(false)` and leaves the batch untouched when the message
    /// would push the batch past its maximum size.
    pub fn add(&mut self, message: &Message) -> Result<bool, ServiceBusError> {
        let encoded = self.encode(message)?;
        let charge = encoded.len() + BATCH_MESSAGE_OVERHEAD;
        if self.size + charge > self.max_size {
            return Ok(false);
        }

        self.size += charge;
        self.sections.push(encoded);
        Ok(true)
    }

    /// Encode a sub-message, stamping the batch id when it has none
    fn encode(&self, message: &Message) -> Result<Bytes, ServiceBusError> {
        let mut amqp = message.to_amqp();
        if amqp.properties.message_id.is_none() {
            amqp.properties.message_id = Some(self.id.clone());
        }
        amqp.format = BATCH_MESSAGE_FORMAT;
        Ok(self.codec.encode(&amqp)?)
    }

    /// Envelope carrying every sub-message
    pub fn to_message(&self) -> AmqpMessage {
        let mut envelope = AmqpMessage::new();
        envelope.format = BATCH_MESSAGE_FORMAT;
        envelope.properties.message_id = Some(self.id.clone());
        envelope.data = self.sections.clone();
        envelope
    }
}

/// Split a list of messages into as few batches as the size limit allows.
///
/// The cursor only moves forward: a message that was placed in a batch is
/// never offered again, even when sending that batch fails.
#[derive(Debug)]
pub struct BatchIterator {
    max_size: usize,
    messages: Vec<Message>,
    cursor: usize,
    codec: Arc<dyn MessageCodec>,
}

impl BatchIterator {
    /// Iterator over `messages` producing batches of at most `max_size` bytes
    pub fn new(max_size: usize, messages: Vec<Message>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            max_size,
            messages,
            cursor: 0,
            codec,
        }
    }

    /// Check if every message has been placed in a batch
    pub fn is_done(&self) -> bool {
        self.cursor >= self.messages.len()
    }

    /// Messages not yet placed in a batch
    pub fn remaining(&self) -> usize {
        self.messages.len().saturating_sub(self.cursor)
    }

    /// Fill the next batch with as many messages as fit.
    ///
    /// Returns `Ok(None)` once done. A message that does not fit an empty
    /// batch fails with [`ServiceBusError::MessageTooLarge`] and stays at the
    /// cursor.
    pub fn next(&mut self) -> Result<Option<MessageBatch>, ServiceBusError> {
        if self.is_done() {
            return Ok(None);
        }

        let mut batch = MessageBatch::new(
            self.max_size,
            Uuid::new_v4().to_string(),
            Arc::clone(&self.codec),
        );

        while let Some(message) = self.messages.get(self.cursor) {
            if !batch.add(message)? {
                break;
            }
            self.cursor += 1;
        }

        if batch.is_empty() {
            let message = &self.messages[self.cursor];
            let size =
                BATCH_WRAPPER_OVERHEAD + batch.encode(message)?.len() + BATCH_MESSAGE_OVERHEAD;
            return Err(ServiceBusError::MessageTooLarge {
                size,
                max_size: self.max_size,
            });
        }

        Ok(Some(batch))
    }
}
