//! Simplified Service Bus message and its mapping onto the transport model.

use crate::amqp::{AmqpMessage, AmqpValue, MessageHeader};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

pub(crate) const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
pub(crate) const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";
pub(crate) const LOCKED_UNTIL_ANNOTATION: &str = "x-opt-locked-until";
pub(crate) const LOCK_TOKEN_ANNOTATION: &str = "x-opt-lock-token";
pub(crate) const SCHEDULED_ENQUEUE_TIME_ANNOTATION: &str = "x-opt-scheduled-enqueue-time";
pub(crate) const PARTITION_KEY_ANNOTATION: &str = "x-opt-partition-key";
pub(crate) const VIA_PARTITION_KEY_ANNOTATION: &str = "x-opt-via-partition-key";
pub(crate) const DEAD_LETTER_SOURCE_ANNOTATION: &str = "x-opt-deadletter-source";

// ============================================================================
// System Properties
// ============================================================================

/// Broker-assigned properties of a received message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProperties {
    pub sequence_number: Option<i64>,
    pub enqueued_time: Option<DateTime<Utc>>,
    /// End of the current peek-lock; updated by lock renewal
    pub locked_until: Option<DateTime<Utc>>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub partition_key: Option<String>,
    pub via_partition_key: Option<String>,
    pub dead_letter_source: Option<String>,
}

// ============================================================================
// Message
// ============================================================================

/// Message sent to or received from an entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Message id; a UUID is assigned on send when empty
    pub id: String,
    pub data: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    /// Application-specific label, carried as the message subject
    pub label: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_group_id: Option<String>,
    pub to: Option<String>,
    /// Messaging session the message belongs to
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub ttl: Option<Duration>,
    pub user_properties: HashMap<String, AmqpValue>,
    pub system_properties: SystemProperties,
    pub lock_token: Option<Uuid>,
    pub delivery_count: u32,
    raw: Option<AmqpMessage>,
}

impl Message {
    /// Create a message with the given payload
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Assign the message to a messaging session
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<AmqpValue>) -> Self {
        self.user_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.system_properties.partition_key = Some(partition_key.into());
        self
    }

    /// Transport message this message was received as, if any
    pub fn raw(&self) -> Option<&AmqpMessage> {
        self.raw.as_ref()
    }

    /// Build the transport message.
    ///
    /// Starts from the received transport message when there is one, so
    /// sections the simplified model does not expose survive a round trip.
    pub fn to_amqp(&self) -> AmqpMessage {
        let mut amqp = self.raw.clone().unwrap_or_default();
        amqp.delivery_tag = None;

        let properties = &mut amqp.properties;
        properties.message_id = Some(self.id.clone()).filter(|id| !id.is_empty());
        properties.content_type = self.content_type.clone();
        properties.correlation_id = self.correlation_id.clone();
        properties.subject = self.label.clone();
        properties.reply_to = self.reply_to.clone();
        properties.reply_to_group_id = self.reply_to_group_id.clone();
        properties.to = self.to.clone();
        properties.group_id = self.group_id.clone();
        properties.group_sequence = self.group_sequence;

        if let Some(ttl) = self.ttl {
            let header = amqp.header.get_or_insert_with(MessageHeader::default);
            header.ttl_ms = Some(ttl.as_millis() as u64);
        }

        amqp.application_properties = self.user_properties.clone();

        let system = &self.system_properties;
        set_annotation(
            &mut amqp,
            SCHEDULED_ENQUEUE_TIME_ANNOTATION,
            system.scheduled_enqueue_time.map(AmqpValue::Timestamp),
        );
        set_annotation(
            &mut amqp,
            PARTITION_KEY_ANNOTATION,
            system.partition_key.clone().map(AmqpValue::String),
        );
        set_annotation(
            &mut amqp,
            VIA_PARTITION_KEY_ANNOTATION,
            system.via_partition_key.clone().map(AmqpValue::String),
        );

        if !self.data.is_empty() || amqp.value.is_none() {
            amqp.data = vec![self.data.clone()];
        }

        amqp
    }

    /// Reconstruct a message from a received transport message.
    ///
    /// The lock token comes from the `x-opt-lock-token` annotation, or from a
    /// 16 byte delivery tag in the broker's GUID byte order.
    pub fn from_amqp(amqp: AmqpMessage) -> Self {
        let data = match amqp.data.as_slice() {
            [] => amqp
                .value
                .as_ref()
                .and_then(AmqpValue::as_bytes)
                .cloned()
                .unwrap_or_default(),
            [single] => single.clone(),
            sections => Bytes::from(sections.concat()),
        };

        let lock_token = amqp
            .annotation(LOCK_TOKEN_ANNOTATION)
            .and_then(AmqpValue::as_uuid)
            .or_else(|| {
                amqp.delivery_tag
                    .as_deref()
                    .and_then(|tag| <[u8; 16]>::try_from(tag).ok())
                    .map(Uuid::from_bytes_le)
            });

        let annotation_time = |key: &str| amqp.annotation(key).and_then(AmqpValue::as_timestamp);
        let annotation_string = |key: &str| {
            amqp.annotation(key)
                .and_then(AmqpValue::as_str)
                .map(str::to_string)
        };

        let system_properties = SystemProperties {
            sequence_number: amqp
                .annotation(SEQUENCE_NUMBER_ANNOTATION)
                .and_then(AmqpValue::as_i64),
            enqueued_time: annotation_time(ENQUEUED_TIME_ANNOTATION),
            locked_until: annotation_time(LOCKED_UNTIL_ANNOTATION),
            scheduled_enqueue_time: annotation_time(SCHEDULED_ENQUEUE_TIME_ANNOTATION),
            partition_key: annotation_string(PARTITION_KEY_ANNOTATION),
            via_partition_key: annotation_string(VIA_PARTITION_KEY_ANNOTATION),
            dead_letter_source: annotation_string(DEAD_LETTER_SOURCE_ANNOTATION),
        };

        let properties = &amqp.properties;
        Self {
            id: properties.message_id.clone().unwrap_or_default(),
            data,
            content_type: properties.content_type.clone(),
            correlation_id: properties.correlation_id.clone(),
            label: properties.subject.clone(),
            reply_to: properties.reply_to.clone(),
            reply_to_group_id: properties.reply_to_group_id.clone(),
            to: properties.to.clone(),
            group_id: properties.group_id.clone(),
            group_sequence: properties.group_sequence,
            ttl: amqp
                .header
                .as_ref()
                .and_then(|header| header.ttl_ms)
                .map(Duration::from_millis),
            user_properties: amqp.application_properties.clone(),
            system_properties,
            lock_token,
            delivery_count: amqp
                .header
                .as_ref()
                .map(|header| header.delivery_count)
                .unwrap_or(0),
            raw: Some(amqp),
        }
    }
}

impl From<AmqpMessage> for Message {
    fn from(amqp: AmqpMessage) -> Self {
        Self::from_amqp(amqp)
    }
}

fn set_annotation(amqp: &mut AmqpMessage, key: &str, value: Option<AmqpValue>) {
    match value {
        Some(value) => {
            amqp.annotations.insert(key.to_string(), value);
        }
        None => {
            amqp.annotations.remove(key);
        }
    }
}

// ============================================================================
// Send Options
// ============================================================================

/// Per-send overrides applied after session stamping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    message_id: Option<String>,
    clear_session_id: bool,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send with an explicit message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Send without session affinity, so partitioned entities spread the
    /// message freely
    pub fn without_session_id(mut self) -> Self {
        self.clear_session_id = true;
        self
    }

    pub(crate) fn apply(&self, message: &mut Message) {
        if let Some(message_id) = &self.message_id {
            message.id = message_id.clone();
        }
        if self.clear_session_id {
            message.group_id = None;
            message.group_sequence = None;
        }
    }
}
