//! Lease-locked job scheduler.
//!
//! Each worker process runs one [`JobScheduler`] over the same static table of
//! [`JobDescriptor`]s. On every tick the scheduler tries to claim each job; the store
//! guarantees that at most one worker wins a claim while the lease is live. The winner
//! runs the handler in its own task, renews the lease every third of the lease timeout
//! while it runs, and releases it with the run's outcome and the next due time.
//!
//! Handler errors and panics are recorded on the job row (`fail_count`, `last_error`);
//! the job stays on schedule and the loop keeps going.

use crate::metrics::SchedulerMetrics;
use courier_core::environment::Clock;
use courier_core::{
    BrokerError, JobCompletion, JobOutcome, JobRegistration, JobStore, JobStoreError, Lease,
    OutboxError, Schedule,
};
use futures::future::{BoxFuture, join_all};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Errors a job body can return.
#[derive(Error, Debug)]
pub enum JobError {
    /// Outbox access failed
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Broker access failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The lease was taken over while the job ran
    #[error("Lease lost for job '{0}'")]
    LeaseLost(String),

    /// Any other failure
    #[error("{0}")]
    Failed(String),
}

/// What a running job can see about its own execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    lease: Lease,
    lease_lost: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl JobContext {
    /// The lease this run holds.
    #[must_use]
    pub const fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Name of the running job.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.lease.job_name
    }

    /// Whether a lease renewal was rejected. Long-running jobs should stop early.
    #[must_use]
    pub fn is_lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Whether the worker is shutting down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Fail with [`JobError::LeaseLost`] once the lease is gone.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::LeaseLost`] if a renewal was rejected.
    pub fn ensure_lease(&self) -> Result<(), JobError> {
        if self.is_lease_lost() {
            Err(JobError::LeaseLost(self.lease.job_name.clone()))
        } else {
            Ok(())
        }
    }
}

/// The body of a scheduled job.
pub trait JobHandler: Send + Sync {
    /// Run once.
    fn run<'a>(&'a self, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>>;
}

/// A job in the static job table.
#[derive(Clone)]
pub struct JobDescriptor {
    /// Unique job name
    pub name: String,
    /// When the job runs
    pub schedule: Schedule,
    /// What the job does
    pub handler: Arc<dyn JobHandler>,
}

impl JobDescriptor {
    /// Describe a job.
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: Schedule, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            schedule,
            handler,
        }
    }
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("name", &self.name)
            .field("schedule", &self.schedule.to_string())
            .finish_non_exhaustive()
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Identity written to `locked_by`
    pub worker_id: String,
    /// Age after which a lease is considered stale and may be reclaimed
    pub lease_timeout: Duration,
    /// Pause between ticks
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Result of one job run on this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    /// Job name
    pub name: String,
    /// How the handler ended
    pub outcome: JobOutcome,
    /// Whether the release was applied (false: the lease had been lost)
    pub released: bool,
}

/// Claims and runs due jobs.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    jobs: Vec<JobDescriptor>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl JobScheduler {
    /// Create a scheduler over the job table. `shutdown` flips to `true` to stop
    /// [`run`](Self::run); it is also visible to job bodies through their context.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        jobs: Vec<JobDescriptor>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            jobs,
            config,
            shutdown,
        }
    }

    /// Scheduler settings.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Upsert every job row. Existing leases and due times are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError`] if a registration cannot be written.
    pub async fn register_all(&self) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        for job in &self.jobs {
            let row = self
                .store
                .register(JobRegistration {
                    name: job.name.clone(),
                    schedule_spec: job.schedule.to_string(),
                    first_run_at: job.schedule.first_run_at(now),
                })
                .await?;
            tracing::info!(
                job = %row.name,
                schedule = %row.schedule_spec,
                next_run_at = ?row.next_run_at,
                "Job registered"
            );
        }
        Ok(())
    }

    /// Claim and run every job that is due, concurrently, and wait for them.
    ///
    /// Jobs whose claim fails because of a store error are skipped for this tick.
    pub async fn run_once(&self) -> Vec<JobRun> {
        let runs = self.jobs.iter().map(|job| self.try_run(job));
        join_all(runs).await.into_iter().flatten().collect()
    }

    /// Register the jobs, then tick until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError`] only if registration fails; tick errors are logged.
    pub async fn run(&self) -> Result<(), JobStoreError> {
        self.register_all().await?;
        tracing::info!(
            worker_id = %self.config.worker_id,
            jobs = self.jobs.len(),
            "Scheduler started"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_once().await;

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Scheduler stopped");
        Ok(())
    }

    async fn try_run(&self, job: &JobDescriptor) -> Option<JobRun> {
        let claim = self
            .store
            .claim(&job.name, &self.config.worker_id, self.config.lease_timeout)
            .await;

        match claim {
            Ok(Some(lease)) => Some(self.execute(job, lease).await),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job = %job.name, error = %e, "Claim failed");
                None
            }
        }
    }

    async fn execute(&self, job: &JobDescriptor, lease: Lease) -> JobRun {
        tracing::info!(job = %job.name, token = lease.token, "Job claimed");
        let started = Instant::now();

        let lease_lost = Arc::new(AtomicBool::new(false));
        let ctx = JobContext {
            lease: lease.clone(),
            lease_lost: Arc::clone(&lease_lost),
            shutdown: self.shutdown.clone(),
        };
        let handler = Arc::clone(&job.handler);
        let mut task = tokio::spawn(async move { handler.run(&ctx).await });

        let renew_every = (self.config.lease_timeout / 3).max(Duration::from_millis(10));
        let mut renewals = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = renewals.tick() => self.renew(&lease, &lease_lost).await,
            }
        };

        let outcome = match joined {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(e) if e.is_panic() => {
                JobOutcome::Failed(format!("job panicked: {}", panic_message(&*e.into_panic())))
            }
            Err(e) => JobOutcome::Failed(format!("job task aborted: {e}")),
        };

        let finished_at = self.clock.now();
        let completion = JobCompletion {
            outcome: outcome.clone(),
            finished_at,
            next_run_at: job.schedule.next_run_after(finished_at),
        };
        let succeeded = outcome == JobOutcome::Succeeded;
        SchedulerMetrics::record_run(&job.name, succeeded, started.elapsed());

        let released = match self.store.release(&lease, completion.clone()).await {
            Ok(true) => true,
            Ok(false) => {
                SchedulerMetrics::record_lease_lost(&job.name);
                tracing::warn!(
                    job = %job.name,
                    token = lease.token,
                    "Lease was lost during the run; release not applied"
                );
                false
            }
            Err(e) => {
                tracing::error!(job = %job.name, error = %e, "Release failed");
                false
            }
        };

        match &outcome {
            JobOutcome::Succeeded => tracing::info!(
                job = %job.name,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                next_run_at = ?completion.next_run_at,
                "Job finished"
            ),
            JobOutcome::Failed(error) => tracing::warn!(
                job = %job.name,
                error = %error,
                next_run_at = ?completion.next_run_at,
                "Job failed"
            ),
        }

        JobRun {
            name: job.name.clone(),
            outcome,
            released,
        }
    }

    async fn renew(&self, lease: &Lease, lease_lost: &AtomicBool) {
        if lease_lost.load(Ordering::SeqCst) {
            return;
        }
        match self.store.renew(lease).await {
            Ok(true) => tracing::debug!(job = %lease.job_name, "Lease renewed"),
            Ok(false) => {
                lease_lost.store(true, Ordering::SeqCst);
                SchedulerMetrics::record_lease_lost(&lease.job_name);
                tracing::warn!(job = %lease.job_name, token = lease.token, "Lease lost");
            }
            Err(e) => tracing::warn!(job = %lease.job_name, error = %e, "Lease renewal failed"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
