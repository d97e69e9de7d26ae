//! Transport-level message model.
//!
//! [`AmqpMessage`] is the shape the transport sends and receives: header,
//! message annotations, properties, application properties and a body made
//! of data sections or a single value. [`AmqpValue`] covers the AMQP types the
//! link layer reads and writes. Map keys are restricted to strings, which is
//! all the Service Bus management and claims bodies use.

use crate::error::CodecError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

/// Message format code of a batch envelope
pub const BATCH_MESSAGE_FORMAT: u32 = 0x8001_3700;

// ============================================================================
// Values
// ============================================================================

/// Typed AMQP value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Double(f64),
    String(String),
    Binary(#[serde(with = "bytes_serde")] Bytes),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    List(Vec<AmqpValue>),
    Map(HashMap<String, AmqpValue>),
}

impl AmqpValue {
    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Long(_) => "long",
            Self::ULong(_) => "ulong",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer value widened to `i64`, if it fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(i64::from(*value)),
            Self::UInt(value) => Some(i64::from(*value)),
            Self::Long(value) => Some(*value),
            Self::ULong(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AmqpValue]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, AmqpValue>> {
        match self {
            Self::Map(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for AmqpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::ULong(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Self::Uuid(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::List(v) => write!(f, "<list of {}>", v.len()),
            Self::Map(v) => write!(f, "<map of {}>", v.len()),
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AmqpValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for AmqpValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for AmqpValue {
    fn from(value: u32) -> Self {
        Self::UInt(value)
    }
}

impl From<i64> for AmqpValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<u64> for AmqpValue {
    fn from(value: u64) -> Self {
        Self::ULong(value)
    }
}

impl From<Bytes> for AmqpValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Uuid> for AmqpValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for AmqpValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Vec<AmqpValue>> for AmqpValue {
    fn from(value: Vec<AmqpValue>) -> Self {
        Self::List(value)
    }
}

impl From<HashMap<String, AmqpValue>> for AmqpValue {
    fn from(value: HashMap<String, AmqpValue>) -> Self {
        Self::Map(value)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Transport header section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub durable: bool,
    pub priority: u8,
    /// Time to live in milliseconds
    pub ttl_ms: Option<u64>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

/// Immutable properties section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

/// Message as carried by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmqpMessage {
    /// Transfer format code; not part of the encoded message
    #[serde(skip)]
    pub format: u32,

    /// Delivery tag assigned by the transport on receipt
    #[serde(skip)]
    pub delivery_tag: Option<Bytes>,

    #[serde(default)]
    pub header: Option<MessageHeader>,

    #[serde(default)]
    pub annotations: HashMap<String, AmqpValue>,

    #[serde(default)]
    pub properties: MessageProperties,

    #[serde(default)]
    pub application_properties: HashMap<String, AmqpValue>,

    #[serde(default, with = "bytes_vec_serde")]
    pub data: Vec<Bytes>,

    #[serde(default)]
    pub value: Option<AmqpValue>,
}

impl AmqpMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message whose body is a single AMQP value
    pub fn with_value(value: impl Into<AmqpValue>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Add an application property
    pub fn with_application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn application_property(&self, key: &str) -> Option<&AmqpValue> {
        self.application_properties.get(key)
    }

    pub fn annotation(&self, key: &str) -> Option<&AmqpValue> {
        self.annotations.get(key)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Binary marshaling of [`AmqpMessage`] provided by the transport
pub trait MessageCodec: Send + Sync + fmt::Debug {
    fn encode(&self, message: &AmqpMessage) -> Result<Bytes, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<AmqpMessage, CodecError>;
}

/// JSON codec used by the in-memory transport
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageCodec;

impl MessageCodec for JsonMessageCodec {
    fn encode(&self, message: &AmqpMessage) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<AmqpMessage, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

mod bytes_vec_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(sections: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Vec<String> = sections
            .iter()
            .map(|section| general_purpose::STANDARD.encode(section))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|section| {
                general_purpose::STANDARD
                    .decode(section)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
