//! Producer-side broker client: connection, topology, publishing and close.

use crate::consumer;
use crate::headers;
use courier_core::{
    BrokerError, ConsumerHandle, Envelope, MessageBroker, MessageHandler, QueueBinding, Topology,
};
use courier_runtime::retry::{RetryPolicy, retry_with_predicate};
use futures::future::BoxFuture;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};

/// Slack between `message.timeout.ms` and the outer confirm deadline, so librdkafka's
/// own `MessageTimedOut` report normally arrives first.
const CONFIRM_GRACE: Duration = Duration::from_millis(500);

/// Settings shared by the producer, admin client and consumers.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) brokers: String,
    pub(crate) client_id: String,
    pub(crate) compression: String,
    pub(crate) confirm_timeout: Duration,
    pub(crate) flush_timeout: Duration,
    pub(crate) auto_offset_reset: String,
    pub(crate) retry_policy: RetryPolicy,
}

/// State shared between the broker handle and its consumer tasks.
pub(crate) struct Inner {
    pub(crate) settings: Settings,
    producer: RwLock<Option<FutureProducer>>,
    connect_lock: Mutex<()>,
    topology: Mutex<Topology>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Redpanda implementation of [`MessageBroker`].
///
/// Exchanges map to topics and routing keys to record keys. The client owns a
/// single idempotent producer (`acks=all`) that is rebuilt with backoff whenever a
/// transport failure marks it broken; the last declared topology is re-declared
/// after every reconnect.
///
/// Cloning is cheap and shares the connection.
///
/// # Example
///
/// ```no_run
/// use courier_core::{ExchangeSpec, MessageBroker, Topology};
/// use courier_redpanda::RedpandaBroker;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092")
///     .confirm_timeout(Duration::from_secs(5))
///     .build()?;
///
/// broker.connect().await?;
/// broker
///     .declare_topology(&Topology::new().exchange(ExchangeSpec::new("ticket.sales")))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RedpandaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBroker")
            .field("brokers", &self.inner.settings.brokers)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl RedpandaBroker {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Broker addresses this client connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.inner.settings.brokers
    }

    /// Whether [`close`](MessageBroker::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Builder for [`RedpandaBroker`]. Building performs no I/O.
#[derive(Debug, Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    compression: Option<String>,
    confirm_timeout: Option<Duration>,
    flush_timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    retry_policy: Option<RetryPolicy>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Client id reported to the broker. Default: `courier`.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`. Default: `none`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a publish waits for the broker's confirmation. Default: 5 seconds.
    #[must_use]
    pub const fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = Some(timeout);
        self
    }

    /// Upper bound on flushing pending records during close. Default: 10 seconds.
    #[must_use]
    pub const fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    /// Where new consumer groups start reading. Default: `earliest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Backoff used for connecting, subscribing and settling deliveries.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no brokers were configured.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;

        let settings = Settings {
            brokers,
            client_id: self.client_id.unwrap_or_else(|| "courier".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            confirm_timeout: self.confirm_timeout.unwrap_or(Duration::from_secs(5)),
            flush_timeout: self.flush_timeout.unwrap_or(Duration::from_secs(10)),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            retry_policy: self.retry_policy.unwrap_or_default(),
        };
        let (shutdown, _) = watch::channel(false);

        Ok(RedpandaBroker {
            inner: Arc::new(Inner {
                settings,
                producer: RwLock::new(None),
                connect_lock: Mutex::new(()),
                topology: Mutex::new(Topology::new()),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        })
    }
}

impl Settings {
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id);
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let timeout_ms = self.confirm_timeout.as_millis().to_string();
        let mut config = self.client_config();
        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", &self.compression)
            .set("message.timeout.ms", &timeout_ms);
        config
    }

    /// How long `send` waits for a delivery report before giving up on the producer.
    pub(crate) fn confirm_deadline(&self) -> Duration {
        self.confirm_timeout + CONFIRM_GRACE
    }
}

/// Map a produce failure onto the broker error taxonomy.
pub(crate) fn classify_produce_error(exchange: &str, error: &KafkaError) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize,
        ) => BrokerError::InvalidMessage(error.to_string()),
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::MessageTimedOut,
        ) => BrokerError::Transport(error.to_string()),
        _ => BrokerError::PublishFailed {
            exchange: exchange.to_string(),
            reason: error.to_string(),
        },
    }
}

fn ensure_open(inner: &Inner) -> Result<(), BrokerError> {
    if inner.closed.load(Ordering::SeqCst) {
        Err(BrokerError::Closed)
    } else {
        Ok(())
    }
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Build a producer and prove the cluster is reachable.
    async fn open_producer(&self) -> Result<FutureProducer, BrokerError> {
        let producer: FutureProducer = self
            .settings
            .producer_config()
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let probe = producer.clone();
        let timeout = self.settings.confirm_timeout;
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| BrokerError::ConnectionFailed(format!("Metadata probe aborted: {e}")))?
        .map_err(|e| BrokerError::ConnectionFailed(format!("Brokers unreachable: {e}")))?;

        Ok(producer)
    }

    /// (Re)connect with backoff and re-declare the remembered topology.
    async fn connect(&self) -> Result<FutureProducer, BrokerError> {
        let _guard = self.connect_lock.lock().await;
        ensure_open(self)?;
        if let Some(producer) = self.producer.read().await.as_ref() {
            return Ok(producer.clone());
        }

        let producer = retry_with_predicate(
            &self.settings.retry_policy,
            || self.open_producer(),
            BrokerError::is_retryable,
        )
        .await?;

        let topology = self.topology.lock().await.clone();
        if !topology.exchanges.is_empty() {
            self.create_topics(&topology).await?;
        }

        *self.producer.write().await = Some(producer.clone());
        tracing::info!(brokers = %self.settings.brokers, "Connected to Redpanda");
        Ok(producer)
    }

    async fn producer(&self) -> Result<FutureProducer, BrokerError> {
        ensure_open(self)?;
        if let Some(producer) = self.producer.read().await.as_ref() {
            return Ok(producer.clone());
        }
        self.connect().await
    }

    async fn mark_broken(&self) {
        if self.producer.write().await.take().is_some() {
            tracing::warn!(brokers = %self.settings.brokers, "Producer marked broken; reconnecting on next publish");
        }
    }

    async fn create_topics(&self, topology: &Topology) -> Result<(), BrokerError> {
        let admin: AdminClient<DefaultClientContext> = self
            .settings
            .client_config()
            .create()
            .map_err(|e| BrokerError::TopologyFailed(format!("Failed to create admin client: {e}")))?;

        let destinations = topology.destinations();
        let topics: Vec<NewTopic<'_>> = destinations
            .iter()
            .map(|(name, spec)| {
                NewTopic::new(
                    name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
            })
            .collect();
        let options =
            AdminOptions::new().operation_timeout(Some(Timeout::After(self.settings.confirm_timeout)));

        let results = admin
            .create_topics(&topics, &options)
            .await
            .map_err(|e| BrokerError::TopologyFailed(e.to_string()))?;

        for result in results {
            match result {
                Ok(topic) => tracing::info!(topic = %topic, "Topic created"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    tracing::debug!(topic = %topic, "Topic already exists");
                }
                Err((topic, code)) => {
                    return Err(BrokerError::TopologyFailed(format!(
                        "Failed to create topic '{topic}': {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Produce one record and wait for its delivery report.
    pub(crate) async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: OwnedHeaders,
    ) -> Result<(), BrokerError> {
        let producer = self.producer().await?;
        let timeout = self.settings.confirm_timeout;
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        let report = tokio::time::timeout(
            self.settings.confirm_deadline(),
            producer.send(record, Timeout::After(timeout)),
        )
        .await;
        let Ok(delivery) = report else {
            // librdkafka did not report within its own message timeout
            self.mark_broken().await;
            return Err(BrokerError::ConfirmTimeout {
                exchange: topic.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        };

        match delivery {
            // a confirm racing close is not reported as success
            Ok(_) if self.is_closed() => Err(BrokerError::Closed),
            Ok((partition, offset)) => {
                tracing::debug!(topic = %topic, key = %key, partition, offset, "Record confirmed");
                Ok(())
            }
            Err((error, _)) => {
                let error = classify_produce_error(topic, &error);
                if matches!(error, BrokerError::Transport(_)) {
                    self.mark_broken().await;
                }
                tracing::warn!(topic = %topic, error = %error, "Publish failed");
                Err(error)
            }
        }
    }
}

impl MessageBroker for RedpandaBroker {
    fn connect(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move { self.inner.connect().await.map(|_| ()) })
    }

    fn declare_topology(&self, topology: &Topology) -> BoxFuture<'_, Result<(), BrokerError>> {
        let topology = topology.clone();
        Box::pin(async move {
            ensure_open(&self.inner)?;
            self.inner.create_topics(&topology).await?;

            let mut known = self.inner.topology.lock().await;
            *known = topology
                .exchanges
                .into_iter()
                .fold(known.clone(), Topology::exchange);
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            ensure_open(&self.inner)?;
            if exchange.is_empty() {
                return Err(BrokerError::InvalidMessage("exchange must not be empty".to_string()));
            }
            if routing_key.is_empty() {
                return Err(BrokerError::InvalidMessage(
                    "routing key must not be empty".to_string(),
                ));
            }

            let payload = envelope
                .to_bytes()
                .map_err(|e| BrokerError::Serialization(e.to_string()))?;
            let headers = headers::envelope_headers(&envelope, &routing_key, 1);

            self.inner
                .send(&exchange, &routing_key, &payload, headers)
                .await
        })
    }

    fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> BoxFuture<'_, Result<ConsumerHandle, BrokerError>> {
        Box::pin(async move {
            ensure_open(&self.inner)?;
            consumer::spawn(Arc::clone(&self.inner), binding, handler).await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let _ = self.inner.shutdown.send(true);

            let Some(producer) = self.inner.producer.write().await.take() else {
                tracing::info!("Broker client closed");
                return Ok(());
            };
            let timeout = self.inner.settings.flush_timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::Transport(format!("Flush aborted: {e}")))?
                .map_err(|e| BrokerError::Transport(format!("Flush failed: {e}")))?;

            tracing::info!("Broker client closed");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaBroker::builder().build(),
            Err(BrokerError::ConnectionFailed(_))
        ));
        assert!(RedpandaBroker::builder().brokers("  ").build().is_err());
    }

    #[test]
    fn producer_is_idempotent_with_full_acks() {
        let broker = RedpandaBroker::builder()
            .brokers("localhost:9092")
            .confirm_timeout(Duration::from_millis(1500))
            .build()
            .unwrap();
        let config = broker.inner.settings.producer_config();

        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("message.timeout.ms"), Some("1500"));
        assert!(broker.inner.settings.confirm_deadline() > Duration::from_millis(1500));
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn produce_errors_are_classified() {
        let oversized = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            classify_produce_error("ticket.sales", &oversized),
            BrokerError::InvalidMessage(_)
        ));

        let expired = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(matches!(
            classify_produce_error("ticket.sales", &expired),
            BrokerError::Transport(_)
        ));

        let down = KafkaError::MessageProduction(RDKafkaErrorCode::AllBrokersDown);
        let error = classify_produce_error("ticket.sales", &down);
        assert!(matches!(error, BrokerError::Transport(_)));
        assert!(error.is_retryable());

        let other = KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed);
        assert!(matches!(
            classify_produce_error("ticket.sales", &other),
            BrokerError::PublishFailed { exchange, .. } if exchange == "ticket.sales"
        ));
    }

    #[tokio::test]
    async fn closed_client_refuses_work() {
        let broker = RedpandaBroker::builder()
            .brokers("localhost:9092")
            .build()
            .unwrap();
        broker.close().await.unwrap();

        assert!(broker.is_closed());
        let envelope = Envelope {
            message_id: courier_core::MessageId::new(),
            correlation_id: courier_core::CorrelationId::new(),
            message_type: "ticket.sale.completed".to_string(),
            payload: serde_json::json!({}),
            published_at: chrono::Utc::now(),
        };
        assert!(matches!(
            broker.publish("ticket.sales", "ticket.sale.completed", &envelope).await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(broker.connect().await, Err(BrokerError::Closed)));
        // second close is a no-op
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_routing_key_is_invalid() {
        let broker = RedpandaBroker::builder()
            .brokers("localhost:9092")
            .build()
            .unwrap();
        let envelope = Envelope {
            message_id: courier_core::MessageId::new(),
            correlation_id: courier_core::CorrelationId::new(),
            message_type: String::new(),
            payload: serde_json::json!({}),
            published_at: chrono::Utc::now(),
        };

        let error = broker.publish("ticket.sales", "", &envelope).await.unwrap_err();
        assert!(matches!(error, BrokerError::InvalidMessage(_)));
        assert!(!error.is_retryable());
    }
}
