//! Message broker abstraction: topology, confirmed publish, acknowledged consume.
//!
//! # Key Principles
//!
//! - **Outbox first**: messages are recorded in the outbox before being published
//! - **Confirmed publish**: `Ok(())` from [`MessageBroker::publish`] means the broker
//!   durably accepted the message; a confirm timeout is an error, never success
//! - **At-least-once delivery**: consumers may see a message more than once and must
//!   de-duplicate on the envelope's correlation id
//! - **Bounded redelivery**: a handler that keeps failing sends the message to the
//!   exchange's dead-letter destination instead of requeueing it forever
//!
//! # Implementations
//!
//! - `RedpandaBroker` (in `courier-redpanda`): Kafka-compatible production client
//! - `MockBroker` (in `courier-testing`): scriptable, records every publish

use crate::envelope::Envelope;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Suffix appended to an exchange name to form its dead-letter destination.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Dead-letter destination for `exchange`.
#[must_use]
pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{exchange}{DEAD_LETTER_SUFFIX}")
}

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected the message
    #[error("Publish failed for exchange '{exchange}': {reason}")]
    PublishFailed {
        /// The exchange that failed
        exchange: String,
        /// The reason for failure
        reason: String,
    },

    /// No delivery confirmation arrived in time
    #[error("Publish to '{exchange}' was not confirmed within {timeout_ms}ms")]
    ConfirmTimeout {
        /// The exchange published to
        exchange: String,
        /// The confirm timeout that elapsed
        timeout_ms: u64,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The message is malformed and will never be accepted
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The envelope could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Topology declaration failed
    #[error("Topology declaration failed: {0}")]
    TopologyFailed(String),

    /// Failed to start consuming
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue (consumer group)
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// The client was shut down
    #[error("Broker client is closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the same message later can succeed.
    ///
    /// Validation and serialization errors are terminal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidMessage(_) | Self::Serialization(_))
    }

    /// The underlying failure text, without the variant prefix.
    ///
    /// This is what gets recorded on an outbox row; logs use the full `Display`.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::ConnectionFailed(reason)
            | Self::Transport(reason)
            | Self::InvalidMessage(reason)
            | Self::Serialization(reason)
            | Self::TopologyFailed(reason)
            | Self::PublishFailed { reason, .. }
            | Self::SubscriptionFailed { reason, .. } => reason.clone(),
            Self::ConfirmTimeout { .. } | Self::Closed => self.to_string(),
        }
    }
}

/// Declaration of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange (topic) name
    pub name: String,
    /// Partition count for the topic and its dead-letter topic
    pub partitions: i32,
    /// Replication factor
    pub replication_factor: i32,
}

impl ExchangeSpec {
    /// Exchange with one partition and replication factor one.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication_factor: 1,
        }
    }

    /// Set the partition count.
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the replication factor.
    #[must_use]
    pub const fn replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    /// Dead-letter destination for this exchange.
    #[must_use]
    pub fn dead_letter(&self) -> String {
        dead_letter_exchange(&self.name)
    }
}

/// The full set of exchanges a process publishes to or consumes from.
///
/// Declaring the same topology twice is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Declared exchanges
    pub exchanges: Vec<ExchangeSpec>,
}

impl Topology {
    /// Empty topology.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            exchanges: Vec::new(),
        }
    }

    /// Add an exchange. Duplicate names are ignored.
    #[must_use]
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        if !self.exchanges.iter().any(|e| e.name == spec.name) {
            self.exchanges.push(spec);
        }
        self
    }

    /// Every destination to create: each exchange followed by its dead-letter exchange.
    #[must_use]
    pub fn destinations(&self) -> Vec<(String, &ExchangeSpec)> {
        self.exchanges
            .iter()
            .flat_map(|spec| [(spec.name.clone(), spec), (spec.dead_letter(), spec)])
            .collect()
    }
}

/// A consumer queue bound to one or more exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name (consumer group)
    pub queue: String,
    /// Exchanges the queue is bound to
    pub exchanges: Vec<String>,
    /// Routing keys to accept; empty accepts everything
    pub routing_keys: Vec<String>,
    /// Deliveries allowed before a failing message is dead-lettered
    pub max_deliveries: u32,
}

impl QueueBinding {
    /// Bind `queue` to `exchange` with the default budget of five deliveries.
    #[must_use]
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchanges: vec![exchange.into()],
            routing_keys: Vec::new(),
            max_deliveries: 5,
        }
    }

    /// Bind an additional exchange.
    #[must_use]
    pub fn also_bind(mut self, exchange: impl Into<String>) -> Self {
        self.exchanges.push(exchange.into());
        self
    }

    /// Only accept the given routing key (may be called repeatedly).
    #[must_use]
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    /// Set the delivery budget.
    #[must_use]
    pub const fn max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Whether a message with `routing_key` is for this queue.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        self.routing_keys.is_empty() || self.routing_keys.iter().any(|k| k == routing_key)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Exchange the message was read from
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Decoded envelope
    pub envelope: Envelope,
    /// 1 for the first delivery, incremented on every requeue
    pub delivery_count: u32,
}

/// What a handler decided about a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; acknowledge
    Ack,
    /// Transient failure; nack and requeue
    Retry(String),
    /// Permanent failure; nack without requeue (dead-letter)
    Reject(String),
}

/// What the consumer does with the record after the handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledge (commit)
    Ack,
    /// Republish for another delivery, then commit
    Requeue,
    /// Publish to the dead-letter exchange, then commit
    DeadLetter(String),
}

/// Settle a handler outcome against the delivery budget.
#[must_use]
pub fn settle(outcome: &HandlerOutcome, delivery_count: u32, max_deliveries: u32) -> Settlement {
    match outcome {
        HandlerOutcome::Ack => Settlement::Ack,
        HandlerOutcome::Reject(reason) => Settlement::DeadLetter(reason.clone()),
        HandlerOutcome::Retry(reason) if delivery_count >= max_deliveries => {
            Settlement::DeadLetter(format!(
                "delivery budget of {max_deliveries} exhausted: {reason}"
            ))
        }
        HandlerOutcome::Retry(_) => Settlement::Requeue,
    }
}

/// Processes deliveries for a queue.
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery.
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, HandlerOutcome>;
}

/// A running consumer. Dropping the handle leaves the consumer running; call
/// [`ConsumerHandle::stop`] to shut it down.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Wrap a spawned consumer task and its shutdown switch.
    #[must_use]
    pub const fn new(queue: String, shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            queue,
            shutdown,
            task,
        }
    }

    /// The queue this consumer reads.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consumer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the consumer task to exit.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the consumer task panicked.
    pub async fn stop(self) -> Result<(), BrokerError> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|e| {
            BrokerError::Transport(format!("consumer for '{}' ended abnormally: {e}", self.queue))
        })
    }
}

/// Broker client: one owned connection, exposed only through these operations.
///
/// # Lifecycle
///
/// 1. Construct the client (no I/O)
/// 2. [`connect`](Self::connect) and [`declare_topology`](Self::declare_topology)
/// 3. [`publish`](Self::publish) / [`consume`](Self::consume)
/// 4. [`close`](Self::close): in-flight publishes fail, nothing is reported confirmed
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the client can be injected as
/// `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Establish the connection, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] once the retry budget is exhausted.
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Declare exchanges and their dead-letter destinations. Idempotent.
    ///
    /// The topology is remembered and re-declared after a reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopologyFailed`] if a destination cannot be created.
    fn declare_topology(&self, topology: &Topology) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Publish and wait for the broker's confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfirmTimeout`] if no confirmation arrives in time, and
    /// other variants for rejected, malformed or undeliverable messages.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Start consuming `binding` with `handler` in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the consumer cannot be created.
    fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> BoxFuture<'_, Result<ConsumerHandle, BrokerError>>;

    /// Flush, stop consumers and refuse further publishes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if pending messages could not be flushed.
    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_within_budget_requeues() {
        let retry = HandlerOutcome::Retry("db down".to_string());
        assert_eq!(settle(&retry, 1, 3), Settlement::Requeue);
        assert_eq!(settle(&retry, 2, 3), Settlement::Requeue);
        assert!(matches!(settle(&retry, 3, 3), Settlement::DeadLetter(_)));
    }

    #[test]
    fn reject_dead_letters_immediately() {
        let reject = HandlerOutcome::Reject("bad payload".to_string());
        assert_eq!(
            settle(&reject, 1, 10),
            Settlement::DeadLetter("bad payload".to_string())
        );
        assert_eq!(settle(&HandlerOutcome::Ack, 9, 1), Settlement::Ack);
    }

    #[test]
    fn topology_pairs_each_exchange_with_dead_letter() {
        let topology = Topology::new()
            .exchange(ExchangeSpec::new("ticket.sales"))
            .exchange(ExchangeSpec::new("ticket.sales"))
            .exchange(ExchangeSpec::new("merchant.payouts").partitions(3));

        let names: Vec<String> = topology.destinations().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            [
                "ticket.sales",
                "ticket.sales.dead-letter",
                "merchant.payouts",
                "merchant.payouts.dead-letter"
            ]
        );
    }

    #[test]
    fn binding_filters_routing_keys() {
        let all = QueueBinding::new("notifier", "ticket.sales");
        assert!(all.matches("anything"));

        let filtered = all.routing_key("ticket.sale.completed");
        assert!(filtered.matches("ticket.sale.completed"));
        assert!(!filtered.matches("ticket.sale.refunded"));
    }

    #[test]
    fn validation_errors_are_terminal() {
        assert!(!BrokerError::InvalidMessage("empty exchange".into()).is_retryable());
        assert!(!BrokerError::Serialization("nan".into()).is_retryable());
        assert!(BrokerError::Transport("Publish failed".into()).is_retryable());
        assert!(
            BrokerError::ConfirmTimeout {
                exchange: "x".into(),
                timeout_ms: 5000
            }
            .is_retryable()
        );
    }

    #[test]
    fn reason_drops_variant_prefix() {
        assert_eq!(BrokerError::Transport("Publish failed".into()).reason(), "Publish failed");
        assert_eq!(
            BrokerError::PublishFailed {
                exchange: "ticket.sales".into(),
                reason: "Message too large".into()
            }
            .reason(),
            "Message too large"
        );
        assert_eq!(BrokerError::Closed.reason(), "Broker client is closed");
    }
}
