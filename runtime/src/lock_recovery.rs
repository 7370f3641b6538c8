//! Operator-side inspection and clearing of job leases.

use crate::metrics::SchedulerMetrics;
use courier_core::{JobStore, JobStoreError, ScheduledJob};
use std::fmt;
use std::sync::Arc;

/// Leases cleared by one [`LockRecovery::unlock`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockReport {
    /// The jobs as they were before unlocking
    pub unlocked: Vec<ScheduledJob>,
}

impl UnlockReport {
    /// Number of leases cleared.
    #[must_use]
    pub fn len(&self) -> usize {
        self.unlocked.len()
    }

    /// Whether nothing was locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unlocked.is_empty()
    }
}

impl fmt::Display for UnlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unlocked.is_empty() {
            return write!(f, "No locked jobs found");
        }
        for job in &self.unlocked {
            writeln!(f, "{}", describe(job))?;
        }
        write!(f, "Unlocked {} job(s)", self.unlocked.len())
    }
}

/// One line per job: lease holder, lease age and schedule position.
#[must_use]
pub fn describe(job: &ScheduledJob) -> String {
    fn at(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
        value.map_or_else(|| "-".to_string(), |v| v.to_rfc3339())
    }

    format!(
        "{name}: locked_at={locked_at} locked_by={locked_by} last_finished_at={finished} next_run_at={next}",
        name = job.name,
        locked_at = at(job.locked_at),
        locked_by = job.locked_by.as_deref().unwrap_or("-"),
        finished = at(job.last_finished_at),
        next = at(job.next_run_at),
    )
}

/// Lists and clears job leases.
#[derive(Clone)]
pub struct LockRecovery {
    store: Arc<dyn JobStore>,
}

impl LockRecovery {
    /// Create over a job store.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Jobs currently carrying a lease, optionally only `name`.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError`] if the store cannot be queried.
    pub async fn list_locked(&self, name: Option<&str>) -> Result<Vec<ScheduledJob>, JobStoreError> {
        self.store.list_locked(name).await
    }

    /// Clear every matching lease in one atomic statement.
    ///
    /// Jobs without a lease are not touched, so their `last_finished_at` and
    /// schedule stay as they were.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError`] if the update fails.
    pub async fn unlock(&self, name: Option<&str>) -> Result<UnlockReport, JobStoreError> {
        let unlocked = self.store.force_unlock(name).await?;
        for job in &unlocked {
            tracing::warn!(
                job = %job.name,
                locked_by = job.locked_by.as_deref().unwrap_or("-"),
                locked_at = ?job.locked_at,
                "Lease force-unlocked"
            );
        }
        SchedulerMetrics::record_unlocked(unlocked.len());
        Ok(UnlockReport { unlocked })
    }
}
