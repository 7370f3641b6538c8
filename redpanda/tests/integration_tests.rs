//! Integration tests for [`RedpandaBroker`] against a real Kafka-compatible broker.
//!
//! These tests:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds each to spin up the broker
//!
//! Run with `cargo test -p courier-redpanda -- --ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code uses expect for clear failure messages

use courier_core::{
    CorrelationId, Envelope, ExchangeSpec, HandlerOutcome, MessageBroker, MessageId, QueueBinding,
    Topology,
};
use courier_redpanda::RedpandaBroker;
use courier_runtime::RetryPolicy;
use courier_testing::ScriptedHandler;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_broker() -> (ContainerAsync<Kafka>, RedpandaBroker) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");

    let broker = RedpandaBroker::builder()
        .brokers(format!("{host}:{port}"))
        .confirm_timeout(Duration::from_secs(10))
        .retry_policy(
            RetryPolicy::builder()
                .max_retries(30)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(2))
                .build(),
        )
        .build()
        .expect("Failed to build broker");
    broker.connect().await.expect("Failed to connect");

    (kafka, broker)
}

fn envelope(routing_key: &str) -> Envelope {
    Envelope {
        message_id: MessageId::new(),
        correlation_id: CorrelationId::new(),
        message_type: routing_key.to_string(),
        payload: serde_json::json!({ "eventId": "E1", "merchantId": "M1" }),
        published_at: chrono::Utc::now(),
    }
}

async fn wait_for(handler: &ScriptedHandler, count: usize) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while handler.seen().await.len() < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for deliveries");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_confirm_and_consume() {
    let (_kafka, broker) = start_broker().await;
    let topology = Topology::new().exchange(ExchangeSpec::new("ticket.sales"));
    broker.declare_topology(&topology).await.expect("declare");
    // re-declaration is a no-op
    broker.declare_topology(&topology).await.expect("re-declare");

    let handler = ScriptedHandler::new();
    let consumer = broker
        .consume(
            QueueBinding::new("notifier", "ticket.sales"),
            Arc::new(handler.clone()),
        )
        .await
        .expect("consume");

    let sent = envelope("ticket.sale.completed");
    broker
        .publish("ticket.sales", "ticket.sale.completed", &sent)
        .await
        .expect("publish confirmed");

    wait_for(&handler, 1).await;
    let seen = handler.seen().await;
    assert_eq!(seen[0].envelope, sent);
    assert_eq!(seen[0].routing_key, "ticket.sale.completed");
    assert_eq!(seen[0].delivery_count, 1);

    consumer.stop().await.expect("stop");
    broker.close().await.expect("close");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retry_then_dead_letter() {
    let (_kafka, broker) = start_broker().await;
    broker
        .declare_topology(&Topology::new().exchange(ExchangeSpec::new("ticket.refunds")))
        .await
        .expect("declare");

    let handler = ScriptedHandler::with_outcomes([
        HandlerOutcome::Retry("db down".to_string()),
        HandlerOutcome::Retry("db down".to_string()),
    ]);
    let dead = ScriptedHandler::new();
    let consumer = broker
        .consume(
            QueueBinding::new("refunds", "ticket.refunds").max_deliveries(2),
            Arc::new(handler.clone()),
        )
        .await
        .expect("consume");
    let dead_consumer = broker
        .consume(
            QueueBinding::new("refunds-dlq", "ticket.refunds.dead-letter"),
            Arc::new(dead.clone()),
        )
        .await
        .expect("consume dead letters");

    let sent = envelope("ticket.refund.requested");
    broker
        .publish("ticket.refunds", "ticket.refund.requested", &sent)
        .await
        .expect("publish");

    wait_for(&handler, 2).await;
    wait_for(&dead, 1).await;

    let counts: Vec<u32> = handler.seen().await.iter().map(|d| d.delivery_count).collect();
    assert_eq!(counts, vec![1, 2]);
    let buried = dead.seen().await;
    assert_eq!(buried[0].envelope.message_id, sent.message_id);

    consumer.stop().await.expect("stop");
    dead_consumer.stop().await.expect("stop");
    broker.close().await.expect("close");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_after_close_fails() {
    let (_kafka, broker) = start_broker().await;
    broker.close().await.expect("close");

    let result = broker
        .publish("ticket.sales", "ticket.sale.completed", &envelope("ticket.sale.completed"))
        .await;
    assert!(matches!(result, Err(courier_core::BrokerError::Closed)));
}
