//! Publisher orchestrator: record the intent, then attempt delivery.
//!
//! ```text
//! request_external_action
//!   1. create_outbox_message   (pending)  ── error ──► PublishError::Outbox, nothing published
//!   2. broker.publish          ── confirm ──► mark_message_as_sent ──► Ok(receipt)
//!                              ── error ────► mark_message_as_failed
//!                                             (+ mark_message_as_dead if non-retryable)
//!                                             ──► PublishError::Delivery { receipt, .. }
//! ```
//!
//! A failed delivery is not lost: the record stays `failed` and the sweeper retries it.

use crate::metrics::OutboxMetrics;
use courier_core::environment::Clock;
use courier_core::{
    BrokerError, CorrelationId, Inserted, MessageBroker, MessageId, NewOutboxMessage, OutboxError,
    OutboxMessage, OutboxStore,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// A request to notify an external system.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalAction {
    /// Destination exchange
    pub exchange: String,
    /// Routing key (message type)
    pub routing_key: String,
    /// Application payload
    pub payload: serde_json::Value,
    /// Correlation id to continue; a fresh one is generated when absent
    pub correlation_id: Option<CorrelationId>,
    /// Deduplication key; repeated requests with the same key publish once
    pub idempotency_key: Option<String>,
}

impl ExternalAction {
    /// Action with a fresh correlation id and no idempotency key.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            correlation_id: None,
            idempotency_key: None,
        }
    }

    /// Continue an existing conversation.
    #[must_use]
    pub const fn continuing(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn into_outbox_message(self) -> NewOutboxMessage {
        let mut message = NewOutboxMessage::new(self.exchange, self.routing_key, self.payload);
        if let Some(correlation_id) = self.correlation_id {
            message = message.with_correlation_id(correlation_id);
        }
        if let Some(key) = self.idempotency_key {
            message = message.with_idempotency_key(key);
        }
        message
    }
}

/// Identifiers handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublishReceipt {
    /// Id of the outbox record
    pub message_id: MessageId,
    /// Correlation id the consumer will see
    pub correlation_id: CorrelationId,
}

impl From<&OutboxMessage> for PublishReceipt {
    fn from(message: &OutboxMessage) -> Self {
        Self {
            message_id: message.message_id,
            correlation_id: message.correlation_id,
        }
    }
}

/// Errors returned by [`OutboxPublisher::request_external_action`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// The outbox record could not be written; nothing was published.
    #[error("Failed to record outbox message: {0}")]
    Outbox(#[from] OutboxError),

    /// The record was written but delivery failed. It stays in the outbox for retry
    /// unless the failure was terminal.
    #[error("Delivery of message {} failed: {source}", receipt.message_id)]
    Delivery {
        /// Identifiers of the recorded message
        receipt: PublishReceipt,
        /// The broker failure
        #[source]
        source: BrokerError,
    },
}

impl PublishError {
    /// The receipt, when the outbox record was written.
    #[must_use]
    pub const fn receipt(&self) -> Option<PublishReceipt> {
        match self {
            Self::Outbox(_) => None,
            Self::Delivery { receipt, .. } => Some(*receipt),
        }
    }
}

/// How one delivery attempt of a stored message ended.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    /// Confirmed and marked sent
    Sent,
    /// Failed and left for retry
    Failed(BrokerError),
    /// Failed terminally and this attempt moved the row to dead
    Dead(BrokerError),
}

/// Publish one stored message and record the result on its outbox row.
///
/// Bookkeeping errors after the broker answered are logged, not returned: a message
/// confirmed but not marked sent is re-published by the sweeper, which consumers
/// tolerate.
pub(crate) async fn deliver(
    store: &dyn OutboxStore,
    broker: &dyn MessageBroker,
    clock: &dyn Clock,
    message: &OutboxMessage,
) -> DeliveryOutcome {
    let envelope = message.envelope(clock.now());
    let started = Instant::now();

    match broker
        .publish(&message.exchange, &message.routing_key, &envelope)
        .await
    {
        Ok(()) => {
            OutboxMetrics::record_sent(&message.exchange, started.elapsed());
            if let Err(e) = store.mark_message_as_sent(message.message_id).await {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Message confirmed but could not be marked sent; it will be re-published"
                );
            }
            tracing::debug!(
                message_id = %message.message_id,
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Message confirmed"
            );
            DeliveryOutcome::Sent
        }
        Err(error) => {
            OutboxMetrics::record_failed(&message.exchange);
            let reason = error.reason();
            if let Err(e) = store
                .mark_message_as_failed(message.message_id, &reason)
                .await
            {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Could not record failed publish"
                );
            }

            if error.is_retryable() {
                tracing::warn!(
                    message_id = %message.message_id,
                    exchange = %message.exchange,
                    error = %error,
                    "Publish failed; message left for retry"
                );
                return DeliveryOutcome::Failed(error);
            }

            match store.mark_message_as_dead(message.message_id, &reason).await {
                Ok(true) => {
                    OutboxMetrics::record_dead(1);
                    tracing::warn!(
                        message_id = %message.message_id,
                        exchange = %message.exchange,
                        error = %error,
                        "Publish failed permanently; message is dead"
                    );
                    DeliveryOutcome::Dead(error)
                }
                Ok(false) => {
                    tracing::debug!(
                        message_id = %message.message_id,
                        "Message already settled elsewhere; not marked dead"
                    );
                    DeliveryOutcome::Failed(error)
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Could not mark message dead"
                    );
                    DeliveryOutcome::Failed(error)
                }
            }
        }
    }
}

/// Application-facing entry point for outbound messages.
///
/// Cheap to clone; share one instance across request handlers.
#[derive(Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
}

impl OutboxPublisher {
    /// Create a publisher over an outbox store and a connected broker.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
        }
    }

    /// Record `action` in the outbox and try to deliver it once.
    ///
    /// Returns the receipt when the broker confirmed the message, or when an earlier
    /// request with the same idempotency key already recorded it (no second publish).
    ///
    /// # Errors
    ///
    /// - [`PublishError::Outbox`] if the record could not be written; nothing was published
    /// - [`PublishError::Delivery`] if the record was written but delivery failed
    #[tracing::instrument(
        skip(self, action),
        fields(exchange = %action.exchange, routing_key = %action.routing_key)
    )]
    pub async fn request_external_action(
        &self,
        action: ExternalAction,
    ) -> Result<PublishReceipt, PublishError> {
        let message = match self
            .store
            .create_outbox_message(action.into_outbox_message())
            .await?
        {
            Inserted::New(message) => {
                OutboxMetrics::record_created(&message.exchange);
                message
            }
            Inserted::Existing(message) => {
                tracing::info!(
                    message_id = %message.message_id,
                    status = message.status.as_str(),
                    "Idempotency key already recorded; not publishing again"
                );
                OutboxMetrics::record_duplicate();
                return Ok(PublishReceipt::from(&message));
            }
        };

        let receipt = PublishReceipt::from(&message);
        match deliver(
            self.store.as_ref(),
            self.broker.as_ref(),
            self.clock.as_ref(),
            &message,
        )
        .await
        {
            DeliveryOutcome::Sent => Ok(receipt),
            DeliveryOutcome::Failed(source) | DeliveryOutcome::Dead(source) => {
                Err(PublishError::Delivery { receipt, source })
            }
        }
    }
}
