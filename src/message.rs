//! Message types: queue names, payload codec, and delivery handles.

use crate::config::BackendType;
use crate::error::{DecodeError, QueueError, ValidationError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Arbitrary structured payload. The wire form is UTF-8 JSON text, key
/// order irrelevant; no schema is enforced.
pub type Payload = serde_json::Value;

/// Serialize a payload to its textual wire form.
pub fn encode_payload(payload: &Payload) -> Result<String, QueueError> {
    serde_json::to_string(payload).map_err(|e| QueueError::Decode(DecodeError::Json(e)))
}

/// Deserialize a payload from its textual wire form.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, QueueError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| QueueError::Decode(DecodeError::InvalidUtf8))?;
    serde_json::from_str(text).map_err(|e| QueueError::Decode(DecodeError::Json(e)))
}

// ============================================================================
// Queue Names
// ============================================================================

/// Validated logical queue name, mapped by each backend to a physical
/// topic, queue, or list key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create a new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // ASCII alphanumeric plus separators; '.' is needed for Kafka
        // topic conventions.
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

// ============================================================================
// Delivery Handles
// ============================================================================

/// Opaque token identifying one delivery attempt of a message, presented to
/// `acknowledge` exactly once. `None` marks backends without ack semantics;
/// acknowledging a `None` handle is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// Backend has no acknowledgment concept (Redis list pops)
    None,
    /// AMQP delivery tag, scoped to the consumer channel
    Amqp { delivery_tag: u64 },
    /// Kafka consume position; acknowledged by committing `offset + 1`
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
    /// SQS receipt, qualified with the logical queue it was fetched from
    Sqs { queue: QueueName, receipt: String },
    /// In-memory receipt token
    Memory { receipt: String },
}

impl DeliveryHandle {
    /// True for backends without ack semantics
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Backend the handle belongs to
    pub fn backend_type(&self) -> Option<BackendType> {
        match self {
            Self::None => None,
            Self::Amqp { .. } => Some(BackendType::Amqp),
            Self::Kafka { .. } => Some(BackendType::Kafka),
            Self::Sqs { .. } => Some(BackendType::Sqs),
            Self::Memory { .. } => Some(BackendType::Memory),
        }
    }
}

/// A message fetched from a queue: the decoded payload plus the handle for
/// acknowledging this delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub handle: DeliveryHandle,
    pub payload: Payload,
}

impl DeliveredMessage {
    pub fn new(handle: DeliveryHandle, payload: Payload) -> Self {
        Self { handle, payload }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
