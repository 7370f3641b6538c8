//! Wire envelope for published messages.
//!
//! Every message handed to the broker is wrapped in an [`Envelope`] and serialized
//! as JSON:
//!
//! ```json
//! {
//!   "messageId": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
//!   "correlationId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
//!   "type": "ticket.sale.completed",
//!   "payload": { "eventId": "E1", "merchantId": "M1" },
//!   "publishedAt": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! The `type` field carries the routing key of the outbox record.

use crate::ids::{CorrelationId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from envelope encoding.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Failed to encode the envelope.
    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),

    /// Failed to decode bytes into an envelope.
    #[error("Failed to deserialize envelope: {0}")]
    Deserialization(String),
}

/// The message as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Id of the outbox record this message was published from.
    pub message_id: MessageId,
    /// Correlation id consumers de-duplicate on.
    pub correlation_id: CorrelationId,
    /// Message type (the routing key).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Application payload.
    pub payload: serde_json::Value,
    /// When this copy was handed to the broker.
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the payload cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Deserialization`] if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_camel_case_and_type() {
        let envelope = Envelope {
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            message_type: "ticket.sale.completed".to_string(),
            payload: json!({ "eventId": "E1", "merchantId": "M1" }),
            published_at: Utc::now(),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["correlationId", "messageId", "payload", "publishedAt", "type"]
        );
        assert_eq!(object["type"], "ticket.sale.completed");
        assert_eq!(object["payload"]["eventId"], "E1");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Envelope::from_bytes(b"{\"messageId\": 1}"),
            Err(EnvelopeError::Deserialization(_))
        ));
    }
}
