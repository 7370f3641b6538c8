//! Scheduled job records and the lease-locked job store trait.
//!
//! # Lease protocol
//!
//! ```text
//!  idle ──claim (CAS)──► claimed ──► running ──release (fenced)──► idle
//!                                      │
//!                                      └── renew every lease_timeout / 3
//! ```
//!
//! - **Claim** succeeds only if the job is due and its lease is free or stale
//!   (`locked_at` null or older than the lease timeout). It bumps `lease_token`.
//! - **Release** and **renew** only apply while `locked_by` and `lease_token` still
//!   match the caller's [`Lease`]. A worker whose lease was reclaimed (or force-unlocked)
//!   learns about it from a `false` return instead of silently overwriting state.
//! - **Force unlock** is the operator's compensating action; it also bumps the token.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during job store operations.
#[derive(Error, Debug, Clone)]
pub enum JobStoreError {
    /// Underlying database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The job is not registered.
    #[error("Job not found: {0}")]
    NotFound(String),
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    /// Unique job name
    pub name: String,
    /// Schedule spec as registered (see [`crate::schedule::Schedule`])
    pub schedule_spec: String,
    /// When the job is next due; `None` once a one-off job has run
    pub next_run_at: Option<DateTime<Utc>>,
    /// Lease timestamp; presence implies an active or stale lease
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker holding the lease
    pub locked_by: Option<String>,
    /// Fencing token, bumped on every claim and forced unlock
    pub lease_token: i64,
    /// When the last run started
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the last run finished
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Consecutive failed runs
    pub fail_count: u32,
    /// Error of the last failed run
    pub last_error: Option<String>,
}

impl ScheduledJob {
    /// Whether the job currently carries a lease younger than `lease_timeout` at `now`.
    #[must_use]
    pub fn has_live_lease(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        self.locked_at
            .is_some_and(|locked_at| !lease_expired(locked_at, now, lease_timeout))
    }

    /// Whether the job is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Whether a lease taken at `locked_at` is stale at `now`.
#[must_use]
pub fn lease_expired(locked_at: DateTime<Utc>, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
    chrono::Duration::from_std(lease_timeout)
        .ok()
        .and_then(|timeout| locked_at.checked_add_signed(timeout))
        .is_some_and(|expiry| expiry <= now)
}

/// Proof of a successful claim. Required to renew or release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Job the lease is for
    pub job_name: String,
    /// Worker holding the lease
    pub worker_id: String,
    /// Fencing token at claim time
    pub token: i64,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
}

/// Registration of a job at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRegistration {
    /// Unique job name
    pub name: String,
    /// Schedule spec string
    pub schedule_spec: String,
    /// First due time, used only when the job is new
    pub first_run_at: Option<DateTime<Utc>>,
}

/// Outcome of a job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler completed
    Succeeded,
    /// The handler returned an error or panicked
    Failed(String),
}

/// Everything the store needs to release a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    /// How the run ended
    pub outcome: JobOutcome,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Next due time per the schedule; `None` retires the job
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Persistence for scheduled jobs and their leases.
///
/// Claim, renew, release and unlock are each a single atomic conditional update.
/// Implementations take "now" from their own time source (the database clock for
/// Postgres) so that all workers agree on lease age.
pub trait JobStore: Send + Sync {
    /// Insert the job if it is new; otherwise refresh its schedule spec without
    /// touching its lease or next run.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the write fails.
    fn register(
        &self,
        registration: JobRegistration,
    ) -> BoxFuture<'_, Result<ScheduledJob, JobStoreError>>;

    /// Try to take the lease on a due job.
    ///
    /// Returns `None` when the job is not due or another worker holds a live lease.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the update fails.
    fn claim(
        &self,
        name: &str,
        worker_id: &str,
        lease_timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Lease>, JobStoreError>>;

    /// Refresh `locked_at` while the lease still matches. Returns `false` if the lease
    /// was lost.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the update fails.
    fn renew(&self, lease: &Lease) -> BoxFuture<'_, Result<bool, JobStoreError>>;

    /// Clear the lease and record the run. Returns `false` if the lease was lost and
    /// nothing was written.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the update fails.
    fn release(
        &self,
        lease: &Lease,
        completion: JobCompletion,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>>;

    /// Load a single job.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the query fails.
    fn get(&self, name: &str) -> BoxFuture<'_, Result<Option<ScheduledJob>, JobStoreError>>;

    /// All registered jobs ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the query fails.
    fn list(&self) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>>;

    /// Jobs with a non-null `locked_at`, optionally filtered by name.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the query fails.
    fn list_locked(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>>;

    /// Clear the lease of every locked job matching the filter and bump its token.
    ///
    /// Returns the matched jobs as they were before unlocking.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::DatabaseError`] if the update fails.
    fn force_unlock(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(locked_at: Option<DateTime<Utc>>) -> ScheduledJob {
        ScheduledJob {
            name: "outbox-retry-sweeper".to_string(),
            schedule_spec: "every 30s".to_string(),
            next_run_at: None,
            locked_at,
            locked_by: None,
            lease_token: 0,
            last_run_at: None,
            last_finished_at: None,
            fail_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn lease_goes_stale_after_timeout() {
        let locked = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let timeout = Duration::from_secs(60);

        assert!(job(Some(locked)).has_live_lease(locked + chrono::Duration::seconds(59), timeout));
        assert!(!job(Some(locked)).has_live_lease(locked + chrono::Duration::seconds(60), timeout));
        assert!(!job(None).has_live_lease(locked, timeout));
    }

    #[test]
    fn retired_job_is_never_due() {
        assert!(!job(None).is_due(Utc::now()));
    }
}
