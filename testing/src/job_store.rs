//! In-memory job store. TEST ONLY.

use courier_core::environment::Clock;
use courier_core::job::lease_expired;
use courier_core::{
    JobCompletion, JobOutcome, JobRegistration, JobStore, JobStoreError, Lease, ScheduledJob,
};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Job store with the claim/renew/release semantics of the Postgres store.
///
/// Every operation holds the single mutex for its whole check-and-write, so
/// concurrent claims against one instance race the same way conditional updates
/// race in the database: exactly one wins.
#[derive(Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<Mutex<BTreeMap<String, ScheduledJob>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryJobStore {
    /// Create an empty store reading "now" from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the database going away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a job row, e.g. to plant a stale lease.
    pub async fn put(&self, job: ScheduledJob) {
        self.jobs.lock().await.insert(job.name.clone(), job);
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(JobStoreError::DatabaseError(
                "connection refused (simulated)".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

fn holds(job: &ScheduledJob, lease: &Lease) -> bool {
    job.locked_at.is_some()
        && job.locked_by.as_deref() == Some(lease.worker_id.as_str())
        && job.lease_token == lease.token
}

fn matches_filter(job: &ScheduledJob, name: Option<&str>) -> bool {
    name.is_none_or(|name| job.name == name)
}

impl JobStore for InMemoryJobStore {
    fn register(
        &self,
        registration: JobRegistration,
    ) -> BoxFuture<'_, Result<ScheduledJob, JobStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .entry(registration.name.clone())
                .and_modify(|job| job.schedule_spec.clone_from(&registration.schedule_spec))
                .or_insert_with(|| ScheduledJob {
                    name: registration.name.clone(),
                    schedule_spec: registration.schedule_spec.clone(),
                    next_run_at: registration.first_run_at,
                    locked_at: None,
                    locked_by: None,
                    lease_token: 0,
                    last_run_at: None,
                    last_finished_at: None,
                    fail_count: 0,
                    last_error: None,
                });
            Ok(job.clone())
        })
    }

    fn claim(
        &self,
        name: &str,
        worker_id: &str,
        lease_timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Lease>, JobStoreError>> {
        let name = name.to_string();
        let worker_id = worker_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&name) else {
                return Ok(None);
            };

            let lease_free = job
                .locked_at
                .is_none_or(|locked_at| lease_expired(locked_at, now, lease_timeout));
            if !job.is_due(now) || !lease_free {
                return Ok(None);
            }

            job.locked_at = Some(now);
            job.locked_by = Some(worker_id.clone());
            job.lease_token += 1;
            job.last_run_at = Some(now);

            Ok(Some(Lease {
                job_name: name,
                worker_id,
                token: job.lease_token,
                acquired_at: now,
            }))
        })
    }

    fn renew(&self, lease: &Lease) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        let lease = lease.clone();
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&lease.job_name) {
                Some(job) if holds(job, &lease) => {
                    job.locked_at = Some(now);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release(
        &self,
        lease: &Lease,
        completion: JobCompletion,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        let lease = lease.clone();
        Box::pin(async move {
            self.check_available()?;
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&lease.job_name) else {
                return Ok(false);
            };
            if !holds(job, &lease) {
                return Ok(false);
            }

            job.locked_at = None;
            job.locked_by = None;
            job.last_finished_at = Some(completion.finished_at);
            job.next_run_at = completion.next_run_at;
            match completion.outcome {
                JobOutcome::Succeeded => {
                    job.fail_count = 0;
                    job.last_error = None;
                }
                JobOutcome::Failed(error) => {
                    job.fail_count = job.fail_count.saturating_add(1);
                    job.last_error = Some(error);
                }
            }
            Ok(true)
        })
    }

    fn get(&self, name: &str) -> BoxFuture<'_, Result<Option<ScheduledJob>, JobStoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.jobs.lock().await.get(&name).cloned())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.jobs.lock().await.values().cloned().collect())
        })
    }

    fn list_locked(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        let name = name.map(str::to_string);
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .jobs
                .lock()
                .await
                .values()
                .filter(|job| job.locked_at.is_some() && matches_filter(job, name.as_deref()))
                .cloned()
                .collect())
        })
    }

    fn force_unlock(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        let name = name.map(str::to_string);
        Box::pin(async move {
            self.check_available()?;
            let mut jobs = self.jobs.lock().await;
            let mut unlocked = Vec::new();
            for job in jobs.values_mut() {
                if job.locked_at.is_some() && matches_filter(job, name.as_deref()) {
                    unlocked.push(job.clone());
                    job.locked_at = None;
                    job.locked_by = None;
                    job.lease_token += 1;
                }
            }
            Ok(unlocked)
        })
    }
}
