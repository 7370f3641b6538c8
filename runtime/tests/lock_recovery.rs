//! Lock recovery tests.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use courier_core::environment::Clock;
use courier_core::{JobCompletion, JobOutcome, JobRegistration, JobStore};
use courier_runtime::LockRecovery;
use courier_testing::{InMemoryJobStore, ManualClock, manual_clock};
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(60);

async fn seeded() -> (ManualClock, InMemoryJobStore) {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    for name in ["cleanup", "payout", "sweeper"] {
        store
            .register(JobRegistration {
                name: name.to_string(),
                schedule_spec: "every 1m".to_string(),
                first_run_at: Some(clock.now()),
            })
            .await
            .unwrap();
    }

    // "cleanup" has run and finished; the other two are stuck mid-run
    let lease = store.claim("cleanup", "worker-a", LEASE).await.unwrap().unwrap();
    store
        .release(
            &lease,
            JobCompletion {
                outcome: JobOutcome::Succeeded,
                finished_at: clock.now(),
                next_run_at: Some(clock.now() + chrono::Duration::minutes(1)),
            },
        )
        .await
        .unwrap();
    store.claim("payout", "worker-a", LEASE).await.unwrap().unwrap();
    store.claim("sweeper", "worker-b", LEASE).await.unwrap().unwrap();

    (clock, store)
}

#[tokio::test]
async fn unfiltered_unlock_clears_every_lease() {
    let (_clock, store) = seeded().await;
    let before = store.get("cleanup").await.unwrap().unwrap();
    let recovery = LockRecovery::new(Arc::new(store.clone()));

    let locked = recovery.list_locked(None).await.unwrap();
    assert_eq!(locked.len(), 2);

    let report = recovery.unlock(None).await.unwrap();
    let mut names: Vec<_> = report.unlocked.iter().map(|j| j.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["payout", "sweeper"]);
    assert!(report.unlocked.iter().all(|j| j.locked_by.is_some()));

    assert!(recovery.list_locked(None).await.unwrap().is_empty());
    let after = store.get("cleanup").await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn filtered_unlock_touches_only_named_job() {
    let (_clock, store) = seeded().await;
    let recovery = LockRecovery::new(Arc::new(store.clone()));

    let report = recovery.unlock(Some("payout")).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report.unlocked[0].name, "payout");

    let remaining = recovery.list_locked(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "sweeper");
}

#[tokio::test]
async fn unlocked_job_can_be_claimed_again() {
    let (_clock, store) = seeded().await;
    let stuck = store.get("payout").await.unwrap().unwrap();
    assert!(store.claim("payout", "worker-c", LEASE).await.unwrap().is_none());

    LockRecovery::new(Arc::new(store.clone()))
        .unlock(Some("payout"))
        .await
        .unwrap();

    let lease = store.claim("payout", "worker-c", LEASE).await.unwrap().unwrap();
    assert!(lease.token > stuck.lease_token + 1);
}

#[tokio::test]
async fn nothing_to_unlock_is_reported() {
    let clock = manual_clock();
    let recovery = LockRecovery::new(Arc::new(InMemoryJobStore::new(Arc::new(clock))));

    let report = recovery.unlock(None).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.to_string(), "No locked jobs found");
}
