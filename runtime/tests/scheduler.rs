//! Job scheduler tests: lease exclusivity, outcome bookkeeping, panics, renewal.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::environment::Clock;
use courier_core::{JobOutcome, JobStore, Schedule};
use courier_runtime::{
    JobContext, JobDescriptor, JobError, JobHandler, JobScheduler, SchedulerConfig,
};
use courier_testing::{InMemoryJobStore, ManualClock, manual_clock};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    WaitForLeaseLoss,
}

struct TestJob {
    behaviour: Behaviour,
    runs: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl TestJob {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            runs: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Behaviour::Succeed,
            runs: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobHandler for TestJob {
    fn run<'a>(&'a self, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(JobError::Failed("merchant API unreachable".to_string())),
                Behaviour::Panic => panic!("boom"),
                Behaviour::WaitForLeaseLoss => {
                    for _ in 0..400 {
                        if ctx.is_lease_lost() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    ctx.ensure_lease()
                }
            }
        })
    }
}

const LEASE: Duration = Duration::from_secs(60);

fn scheduler(
    store: &InMemoryJobStore,
    clock: &ManualClock,
    worker: &str,
    jobs: Vec<JobDescriptor>,
) -> JobScheduler {
    scheduler_with_lease(store, clock, worker, jobs, LEASE)
}

fn scheduler_with_lease(
    store: &InMemoryJobStore,
    clock: &ManualClock,
    worker: &str,
    jobs: Vec<JobDescriptor>,
    lease_timeout: Duration,
) -> JobScheduler {
    let (_tx, rx) = watch::channel(false);
    JobScheduler::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        jobs,
        SchedulerConfig {
            worker_id: worker.to_string(),
            lease_timeout,
            poll_interval: Duration::from_millis(10),
        },
        rx,
    )
}

fn every_minute(name: &str, handler: Arc<TestJob>) -> JobDescriptor {
    JobDescriptor::new(name, Schedule::Every(Duration::from_secs(60)), handler)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn live_lease_excludes_other_workers_until_stale() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let gate = Arc::new(Notify::new());
    let job_a = TestJob::gated(Arc::clone(&gate));
    let job_b = TestJob::new(Behaviour::Succeed);

    let worker_a = Arc::new(scheduler(&store, &clock, "worker-a", vec![every_minute("report", job_a.clone())]));
    let worker_b = scheduler(&store, &clock, "worker-b", vec![every_minute("report", job_b.clone())]);
    worker_a.register_all().await.unwrap();
    worker_b.register_all().await.unwrap();

    let running = tokio::spawn({
        let worker_a = Arc::clone(&worker_a);
        async move { worker_a.run_once().await }
    });
    while store.list_locked(None).await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(worker_b.run_once().await.is_empty());
    assert_eq!(job_b.runs(), 0);

    clock.advance(chrono::Duration::seconds(61));
    let stolen = worker_b.run_once().await;
    assert_eq!(stolen.len(), 1);
    assert!(stolen[0].released);
    assert_eq!(job_b.runs(), 1);

    gate.notify_one();
    let runs_a = running.await.unwrap();
    assert_eq!(runs_a.len(), 1);
    assert!(!runs_a[0].released, "fenced release must not apply");

    let row = store.get("report").await.unwrap().unwrap();
    assert!(row.locked_at.is_none());
    assert_eq!(row.locked_by, None);
}

#[tokio::test]
async fn failure_is_recorded_and_success_resets_count() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let failing = scheduler(
        &store,
        &clock,
        "worker-a",
        vec![every_minute("payout", TestJob::new(Behaviour::Fail))],
    );
    failing.register_all().await.unwrap();

    let runs = failing.run_once().await;
    assert!(matches!(&runs[0].outcome, JobOutcome::Failed(e) if e.contains("unreachable")));

    let row = store.get("payout").await.unwrap().unwrap();
    assert_eq!(row.fail_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("merchant API unreachable"));
    assert_eq!(
        row.next_run_at,
        Some(clock.now() + chrono::Duration::seconds(60))
    );
    assert_eq!(row.last_finished_at, Some(clock.now()));

    // not due again until the interval has passed
    assert!(failing.run_once().await.is_empty());

    clock.advance(chrono::Duration::seconds(60));
    let healthy = scheduler(
        &store,
        &clock,
        "worker-a",
        vec![every_minute("payout", TestJob::new(Behaviour::Succeed))],
    );
    assert_eq!(healthy.run_once().await[0].outcome, JobOutcome::Succeeded);

    let row = store.get("payout").await.unwrap().unwrap();
    assert_eq!(row.fail_count, 0);
    assert_eq!(row.last_error, None);
}

#[tokio::test]
async fn panicking_job_is_caught_and_rescheduled() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let worker = scheduler(
        &store,
        &clock,
        "worker-a",
        vec![every_minute("flaky", TestJob::new(Behaviour::Panic))],
    );
    worker.register_all().await.unwrap();

    let runs = worker.run_once().await;
    assert!(matches!(&runs[0].outcome, JobOutcome::Failed(e) if e.contains("boom")));
    assert!(runs[0].released);

    let row = store.get("flaky").await.unwrap().unwrap();
    assert_eq!(row.fail_count, 1);
    assert!(row.locked_at.is_none());
    assert!(row.next_run_at.is_some());

    clock.advance(chrono::Duration::seconds(60));
    assert_eq!(worker.run_once().await.len(), 1);
    assert_eq!(store.get("flaky").await.unwrap().unwrap().fail_count, 2);
}

#[tokio::test]
async fn one_off_job_runs_once() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let job = TestJob::new(Behaviour::Succeed);
    let worker = scheduler(
        &store,
        &clock,
        "worker-a",
        vec![JobDescriptor::new("backfill", Schedule::Once, job.clone())],
    );
    worker.register_all().await.unwrap();

    assert_eq!(worker.run_once().await.len(), 1);
    clock.advance(chrono::Duration::days(1));
    assert!(worker.run_once().await.is_empty());
    assert_eq!(job.runs(), 1);
    assert_eq!(store.get("backfill").await.unwrap().unwrap().next_run_at, None);
}

#[tokio::test]
async fn rejected_renewal_flags_lost_lease() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let worker = Arc::new(scheduler_with_lease(
        &store,
        &clock,
        "worker-a",
        vec![every_minute("long", TestJob::new(Behaviour::WaitForLeaseLoss))],
        Duration::from_millis(60),
    ));
    worker.register_all().await.unwrap();

    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run_once().await }
    });
    while store.list_locked(None).await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let unlocked = store.force_unlock(Some("long")).await.unwrap();
    assert_eq!(unlocked.len(), 1);

    let runs = running.await.unwrap();
    assert!(matches!(&runs[0].outcome, JobOutcome::Failed(e) if e.contains("Lease lost")));
    assert!(!runs[0].released);
}

#[tokio::test]
async fn registration_keeps_existing_lease() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let worker = scheduler(
        &store,
        &clock,
        "worker-a",
        vec![every_minute("report", TestJob::new(Behaviour::Succeed))],
    );
    worker.register_all().await.unwrap();
    let lease = store.claim("report", "worker-z", LEASE).await.unwrap().unwrap();

    worker.register_all().await.unwrap();

    let row = store.get("report").await.unwrap().unwrap();
    assert_eq!(row.locked_by.as_deref(), Some("worker-z"));
    assert_eq!(row.lease_token, lease.token);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let clock = manual_clock();
    let store = InMemoryJobStore::new(Arc::new(clock.clone()));
    let job = TestJob::new(Behaviour::Succeed);
    let (tx, rx) = watch::channel(false);
    let worker = JobScheduler::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        vec![every_minute("report", job.clone())],
        SchedulerConfig {
            worker_id: "worker-a".to_string(),
            lease_timeout: LEASE,
            poll_interval: Duration::from_millis(5),
        },
        rx,
    );

    let handle = tokio::spawn(async move { worker.run().await });
    while job.runs() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler should stop")
        .unwrap()
        .unwrap();
    assert_eq!(job.runs(), 1);
}
