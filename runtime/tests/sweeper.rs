//! Retry sweeper and retention cleanup tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::{BrokerError, MessageId, NewOutboxMessage, OutboxStatus, OutboxStore};
use courier_runtime::{OutboxCleanup, OutboxSweeper, SweepReport, SweeperConfig};
use courier_testing::{InMemoryOutboxStore, ManualClock, MockBroker, manual_clock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

struct Harness {
    clock: ManualClock,
    store: InMemoryOutboxStore,
    broker: MockBroker,
    sweeper: OutboxSweeper,
}

fn harness() -> Harness {
    courier_testing::helpers::init_tracing();
    let clock = manual_clock();
    let store = InMemoryOutboxStore::new(Arc::new(clock.clone()));
    let broker = MockBroker::new();
    let sweeper = OutboxSweeper::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        Arc::new(clock.clone()),
        SweeperConfig {
            max_attempts: MAX_ATTEMPTS,
            retry_after: Duration::from_secs(30),
            batch_size: 50,
        },
    );
    Harness {
        clock,
        store,
        broker,
        sweeper,
    }
}

async fn failed_message(store: &InMemoryOutboxStore, attempts: u32) -> MessageId {
    let id = store
        .create_outbox_message(NewOutboxMessage::new(
            "ticket.sales",
            "ticket.sale.completed",
            json!({ "eventId": "E1" }),
        ))
        .await
        .unwrap()
        .message()
        .message_id;
    for _ in 0..attempts {
        store.mark_message_as_failed(id, "Publish failed").await.unwrap();
    }
    id
}

#[tokio::test]
async fn retries_below_budget_and_buries_exhausted() {
    let h = harness();
    let retryable = [
        failed_message(&h.store, 1).await,
        failed_message(&h.store, 1).await,
        failed_message(&h.store, 2).await,
    ];
    let exhausted = failed_message(&h.store, MAX_ATTEMPTS).await;
    h.clock.advance(chrono::Duration::minutes(1));

    let report = h.sweeper.sweep().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            retried: 3,
            sent: 3,
            failed: 0,
            dead: 1
        }
    );
    for id in retryable {
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            OutboxStatus::Sent
        );
    }
    assert_eq!(
        h.store.get(exhausted).await.unwrap().unwrap().status,
        OutboxStatus::Dead
    );
    let published: Vec<_> = h
        .broker
        .published()
        .await
        .into_iter()
        .map(|p| p.envelope.message_id)
        .collect();
    assert_eq!(published.len(), 3);
    assert!(!published.contains(&exhausted));
}

#[tokio::test]
async fn recent_failures_wait_for_retry_after() {
    let h = harness();
    let id = failed_message(&h.store, 1).await;

    let report = h.sweeper.sweep().await.unwrap();
    assert_eq!(report, SweepReport::default());

    h.clock.advance(chrono::Duration::seconds(31));
    let report = h.sweeper.sweep().await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(h.store.get(id).await.unwrap().unwrap().sent_at.is_some());
}

#[tokio::test]
async fn failed_retry_counts_attempt_and_eventually_dies() {
    let h = harness();
    let id = failed_message(&h.store, 1).await;
    h.broker
        .fail_always(Some(BrokerError::Transport("Publish failed".to_string())))
        .await;

    h.clock.advance(chrono::Duration::minutes(1));
    let first = h.sweeper.sweep().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(h.store.get(id).await.unwrap().unwrap().attempts, 2);

    h.clock.advance(chrono::Duration::minutes(1));
    h.sweeper.sweep().await.unwrap();
    assert_eq!(h.store.get(id).await.unwrap().unwrap().attempts, 3);

    h.clock.advance(chrono::Duration::minutes(1));
    let last = h.sweeper.sweep().await.unwrap();
    assert_eq!(last.dead, 1);
    assert_eq!(last.retried, 0);
    let dead = h.store.list_dead(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, id);
}

#[tokio::test]
async fn cleanup_purges_only_old_sent_messages() {
    let h = harness();
    let old = failed_message(&h.store, 0).await;
    h.store.mark_message_as_sent(old).await.unwrap();
    h.clock.advance(chrono::Duration::days(8));
    let recent = failed_message(&h.store, 0).await;
    h.store.mark_message_as_sent(recent).await.unwrap();
    let pending = failed_message(&h.store, 0).await;

    let cleanup = OutboxCleanup::new(
        Arc::new(h.store.clone()),
        Arc::new(h.clock.clone()),
        Duration::from_secs(7 * 24 * 3600),
    );
    assert_eq!(cleanup.purge().await.unwrap(), 1);

    assert!(h.store.get(old).await.unwrap().is_none());
    assert!(h.store.get(recent).await.unwrap().is_some());
    assert!(h.store.get(pending).await.unwrap().is_some());
}
