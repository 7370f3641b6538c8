//! Publisher orchestrator tests against the in-memory outbox and mock broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::{BrokerError, CorrelationId, MessageBroker, OutboxStatus, OutboxStore};
use courier_runtime::{ExternalAction, OutboxPublisher, PublishError};
use courier_testing::{InMemoryOutboxStore, MockBroker, test_clock};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: InMemoryOutboxStore,
    broker: MockBroker,
    publisher: OutboxPublisher,
}

fn harness() -> Harness {
    courier_testing::helpers::init_tracing();
    let clock = Arc::new(test_clock());
    let store = InMemoryOutboxStore::new(clock.clone());
    let broker = MockBroker::new();
    let publisher = OutboxPublisher::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        clock,
    );
    Harness {
        store,
        broker,
        publisher,
    }
}

fn ticket_sale() -> ExternalAction {
    ExternalAction::new(
        "ticket.sales",
        "ticket.sale.completed",
        json!({ "eventId": "E1", "merchantId": "M1" }),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn confirmed_publish_marks_message_sent() {
    let h = harness();

    let receipt = h.publisher.request_external_action(ticket_sale()).await.unwrap();

    let stored = h.store.get(receipt.message_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Sent);
    assert!(stored.sent_at.is_some());
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.correlation_id, receipt.correlation_id);

    let published = h.broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "ticket.sales");
    assert_eq!(published[0].routing_key, "ticket.sale.completed");
    assert_eq!(published[0].envelope.message_id, receipt.message_id);
    assert_eq!(published[0].envelope.message_type, "ticket.sale.completed");
    assert_eq!(published[0].envelope.payload["merchantId"], "M1");
}

#[tokio::test]
async fn network_error_marks_message_failed_once() {
    let h = harness();
    h.broker
        .fail_next(BrokerError::Transport("Publish failed".to_string()))
        .await;

    let err = h
        .publisher
        .request_external_action(ticket_sale())
        .await
        .unwrap_err();

    let receipt = err.receipt().expect("record was written");
    assert!(matches!(err, PublishError::Delivery { .. }));

    let stored = h.store.get(receipt.message_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error.as_deref(), Some("Publish failed"));
    assert!(stored.last_attempt_at.is_some());
    assert!(stored.sent_at.is_none());
    assert!(h.broker.published().await.is_empty());
}

#[tokio::test]
async fn confirm_timeout_is_never_success() {
    let h = harness();
    h.broker
        .fail_next(BrokerError::ConfirmTimeout {
            exchange: "ticket.sales".to_string(),
            timeout_ms: 5000,
        })
        .await;

    let err = h
        .publisher
        .request_external_action(ticket_sale())
        .await
        .unwrap_err();

    let stored = h
        .store
        .get(err.receipt().unwrap().message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
}

#[tokio::test]
async fn close_during_publish_is_not_marked_sent() {
    let h = harness();
    h.broker
        .set_publish_delay(Some(Duration::from_millis(200)))
        .await;

    let in_flight = tokio::spawn({
        let publisher = h.publisher.clone();
        async move { publisher.request_external_action(ticket_sale()).await }
    });
    while h.broker.publish_attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    h.broker.close().await.unwrap();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PublishError::Delivery {
            source: BrokerError::Closed,
            ..
        }
    ));

    let stored = h.store.get(err.receipt().unwrap().message_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert!(stored.sent_at.is_none());
    assert!(h.broker.published().await.is_empty());
}

#[tokio::test]
async fn invalid_message_goes_straight_to_dead() {
    let h = harness();
    h.broker
        .fail_next(BrokerError::InvalidMessage("empty routing key".to_string()))
        .await;

    let err = h
        .publisher
        .request_external_action(ticket_sale())
        .await
        .unwrap_err();

    let stored = h
        .store
        .get(err.receipt().unwrap().message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, OutboxStatus::Dead);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn store_failure_publishes_nothing() {
    let h = harness();
    h.store.set_unavailable(true);

    let err = h
        .publisher
        .request_external_action(ticket_sale())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Outbox(_)));
    assert!(err.receipt().is_none());
    assert_eq!(h.broker.publish_attempts(), 0);
}

#[tokio::test]
async fn concurrent_requests_get_distinct_ids() {
    let h = harness();

    let calls = (0..100).map(|_| {
        let publisher = h.publisher.clone();
        tokio::spawn(async move { publisher.request_external_action(ticket_sale()).await })
    });
    let receipts: Vec<_> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let message_ids: HashSet<_> = receipts.iter().map(|r| r.message_id).collect();
    let correlation_ids: HashSet<_> = receipts.iter().map(|r| r.correlation_id).collect();
    assert_eq!(message_ids.len(), 100);
    assert_eq!(correlation_ids.len(), 100);
    assert_eq!(h.store.len().await, 100);
    assert_eq!(h.broker.published().await.len(), 100);
}

#[tokio::test]
async fn idempotency_key_publishes_once() {
    let h = harness();

    let first = h
        .publisher
        .request_external_action(ticket_sale().idempotency_key("sale-E1-M1"))
        .await
        .unwrap();
    let second = h
        .publisher
        .request_external_action(ticket_sale().idempotency_key("sale-E1-M1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.broker.publish_attempts(), 1);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn continuing_conversation_keeps_correlation_id() {
    let h = harness();
    let correlation_id = CorrelationId::new();

    let receipt = h
        .publisher
        .request_external_action(ticket_sale().continuing(correlation_id))
        .await
        .unwrap();

    assert_eq!(receipt.correlation_id, correlation_id);
    let published = h.broker.published().await;
    assert_eq!(published[0].envelope.correlation_id, correlation_id);
}
