//! Outbox store trait and message types.
//!
//! The outbox is the persisted record of every publish intent. A message is written
//! as `pending` before any attempt is made to hand it to the broker, so the intent
//! survives a crash between the domain write and the publish.
//!
//! # Status lifecycle
//!
//! ```text
//!            confirm
//! pending ────────────────────────────► sent
//!    │                                   ▲
//!    │ publish error        confirm      │
//!    └──────────► failed ────────────────┘
//!                  │  ▲
//!                  │  └── retry fails again (attempts += 1)
//!                  │
//!                  └── attempts >= max / non-retryable ──► dead
//! ```
//!
//! `sent` and `dead` are terminal. Every transition is expressed by implementations
//! as one conditional update keyed on the prior status, never as read-then-write.
//!
//! # Implementations
//!
//! - `PostgresOutboxStore` (in `courier-postgres`): production implementation
//! - `InMemoryOutboxStore` (in `courier-testing`): fast, deterministic testing

use crate::envelope::Envelope;
use crate::ids::{CorrelationId, MessageId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during outbox store operations.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Underlying database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored row could not be decoded.
    #[error("Corrupt outbox record {message_id}: {reason}")]
    CorruptRecord {
        /// The message that failed to decode
        message_id: String,
        /// What was wrong with it
        reason: String,
    },

    /// The message does not exist.
    #[error("Outbox message not found: {0}")]
    NotFound(MessageId),
}

/// Delivery status of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Written, not yet confirmed by the broker
    Pending,
    /// Broker confirmed durable acceptance
    Sent,
    /// Last publish attempt failed; eligible for retry
    Failed,
    /// Retry budget exhausted or non-retryable failure
    Dead,
}

impl OutboxStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            _ => Err(OutboxError::DatabaseError(format!(
                "Invalid outbox status: {s}"
            ))),
        }
    }

    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Dead)
    }

    /// Whether a message in this status may move to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::Sent | Self::Failed | Self::Dead)
        )
    }
}

/// A persisted publish intent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    /// Globally unique message id
    pub message_id: MessageId,
    /// Groups a request with its eventual outcome
    pub correlation_id: CorrelationId,
    /// Destination exchange (topic)
    pub exchange: String,
    /// Routing key; also the envelope `type`
    pub routing_key: String,
    /// Application payload
    pub payload: serde_json::Value,
    /// Current delivery status
    pub status: OutboxStatus,
    /// Number of failed publish attempts
    pub attempts: u32,
    /// Caller-supplied deduplication key
    pub idempotency_key: Option<String>,
    /// When the intent was recorded
    pub created_at: DateTime<Utc>,
    /// When the last publish attempt failed
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the broker confirmed the message
    pub sent_at: Option<DateTime<Utc>>,
    /// Last recorded error
    pub error: Option<String>,
}

impl OutboxMessage {
    /// Build the wire envelope for a publish attempt happening at `published_at`.
    #[must_use]
    pub fn envelope(&self, published_at: DateTime<Utc>) -> Envelope {
        Envelope {
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            message_type: self.routing_key.clone(),
            payload: self.payload.clone(),
            published_at,
        }
    }

    /// Timestamp of the most recent activity, used to age retry candidates.
    #[must_use]
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_attempt_at.unwrap_or(self.created_at)
    }
}

/// Input for [`OutboxStore::create_outbox_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    /// Message id (fresh unless the caller supplied one)
    pub message_id: MessageId,
    /// Correlation id (fresh unless the caller supplied one)
    pub correlation_id: CorrelationId,
    /// Destination exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Application payload
    pub payload: serde_json::Value,
    /// Optional deduplication key
    pub idempotency_key: Option<String>,
}

impl NewOutboxMessage {
    /// Create a new intent with freshly generated ids.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            idempotency_key: None,
        }
    }

    /// Reuse an existing correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Materialize the pending record as it is stored at `created_at`.
    #[must_use]
    pub fn into_pending(self, created_at: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            exchange: self.exchange,
            routing_key: self.routing_key,
            payload: self.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            idempotency_key: self.idempotency_key,
            created_at,
            last_attempt_at: None,
            sent_at: None,
            error: None,
        }
    }
}

/// Result of creating an outbox message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    /// A new pending record was written
    New(OutboxMessage),
    /// A record with the same idempotency key already existed; nothing was written
    Existing(OutboxMessage),
}

impl Inserted {
    /// The stored record, whichever way it came about.
    #[must_use]
    pub const fn message(&self) -> &OutboxMessage {
        match self {
            Self::New(message) | Self::Existing(message) => message,
        }
    }

    /// Consume into the stored record.
    #[must_use]
    pub fn into_message(self) -> OutboxMessage {
        match self {
            Self::New(message) | Self::Existing(message) => message,
        }
    }
}

/// Persistence for publish intents.
///
/// All status transitions are atomic compare-and-swap updates: they apply only when
/// the current status allows the transition, and report through the returned `bool`
/// whether they did. Calling a transition on a terminal message is a no-op.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as `Arc<dyn OutboxStore>`
/// between the publisher and the sweeper.
pub trait OutboxStore: Send + Sync {
    /// Record a new pending publish intent.
    ///
    /// When the message carries an idempotency key that is already stored, the
    /// existing record is returned as [`Inserted::Existing`].
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the write fails.
    fn create_outbox_message(
        &self,
        message: NewOutboxMessage,
    ) -> BoxFuture<'_, Result<Inserted, OutboxError>>;

    /// Transition `pending|failed → sent` and set `sent_at`.
    ///
    /// Returns `false` (no-op) if the message is already sent or dead.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn mark_message_as_sent(&self, message_id: MessageId)
    -> BoxFuture<'_, Result<bool, OutboxError>>;

    /// Transition `pending|failed → failed`, increment `attempts` by one and record the
    /// error and `last_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn mark_message_as_failed(
        &self,
        message_id: MessageId,
        error: &str,
    ) -> BoxFuture<'_, Result<bool, OutboxError>>;

    /// Transition `pending|failed → dead`, recording the reason.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn mark_message_as_dead(
        &self,
        message_id: MessageId,
        reason: &str,
    ) -> BoxFuture<'_, Result<bool, OutboxError>>;

    /// Pending or failed messages below `max_attempts` whose last activity is at or
    /// before `older_than`, oldest first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get_retry_candidates(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>>;

    /// Move every pending/failed message with `attempts >= max_attempts` to `dead`
    /// and return them.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the update fails.
    fn dead_letter_exhausted(
        &self,
        max_attempts: u32,
    ) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>>;

    /// Load a single message.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn get(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<Option<OutboxMessage>, OutboxError>>;

    /// Dead messages, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the query fails.
    fn list_dead(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>>;

    /// Delete sent messages confirmed before `older_than`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the delete fails.
    fn purge_sent(&self, older_than: DateTime<Utc>) -> BoxFuture<'_, Result<u64, OutboxError>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_roundtrip() {
        for status in &[
            OutboxStatus::Pending,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), *status);
        }
        assert!(OutboxStatus::parse("queued").is_err());
    }

    #[test]
    fn terminal_states_never_transition() {
        for next in [
            OutboxStatus::Pending,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
            OutboxStatus::Dead,
        ] {
            assert!(!OutboxStatus::Sent.can_transition_to(next));
            assert!(!OutboxStatus::Dead.can_transition_to(next));
        }
        assert!(!OutboxStatus::Pending.can_transition_to(OutboxStatus::Pending));
        assert!(OutboxStatus::Failed.can_transition_to(OutboxStatus::Sent));
        assert!(OutboxStatus::Pending.can_transition_to(OutboxStatus::Dead));
    }

    #[test]
    fn envelope_type_is_routing_key() {
        let message = NewOutboxMessage::new(
            "ticket.sales",
            "ticket.sale.completed",
            json!({ "eventId": "E1" }),
        )
        .into_pending(Utc::now());

        let envelope = message.envelope(Utc::now());
        assert_eq!(envelope.message_type, "ticket.sale.completed");
        assert_eq!(envelope.message_id, message.message_id);
        assert_eq!(envelope.correlation_id, message.correlation_id);
        assert_eq!(message.last_activity_at(), message.created_at);
    }
}
