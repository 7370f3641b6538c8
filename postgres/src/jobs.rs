//! PostgreSQL job store.

use chrono::{DateTime, Utc};
use courier_core::{
    JobCompletion, JobOutcome, JobRegistration, JobStore, JobStoreError, Lease, ScheduledJob,
};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

macro_rules! job_columns {
    () => {
        "name, schedule_spec, next_run_at, locked_at, locked_by, lease_token, last_run_at, \
         last_finished_at, fail_count, last_error"
    };
}

/// PostgreSQL-backed [`JobStore`].
///
/// Lease age is measured against the database clock, so every worker sees the
/// same staleness regardless of local clock skew.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_locked(&self, name: Option<String>) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM scheduled_jobs \
             WHERE locked_at IS NOT NULL AND ($1::text IS NULL OR name = $1) \
             ORDER BY name"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }
}

fn row_to_job(row: &PgRow) -> Result<ScheduledJob, JobStoreError> {
    let fail_count: i32 = column(row, "fail_count")?;

    Ok(ScheduledJob {
        name: column(row, "name")?,
        schedule_spec: column(row, "schedule_spec")?,
        next_run_at: column(row, "next_run_at")?,
        locked_at: column(row, "locked_at")?,
        locked_by: column(row, "locked_by")?,
        lease_token: column(row, "lease_token")?,
        last_run_at: column(row, "last_run_at")?,
        last_finished_at: column(row, "last_finished_at")?,
        fail_count: u32::try_from(fail_count)
            .map_err(|e| JobStoreError::DatabaseError(format!("Invalid fail_count: {e}")))?,
        last_error: column(row, "last_error")?,
    })
}

fn column<'r, T>(row: &'r PgRow, column: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| JobStoreError::DatabaseError(format!("Column {column}: {e}")))
}

impl JobStore for PostgresJobStore {
    fn register(
        &self,
        registration: JobRegistration,
    ) -> BoxFuture<'_, Result<ScheduledJob, JobStoreError>> {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "INSERT INTO scheduled_jobs (name, schedule_spec, next_run_at) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO UPDATE SET schedule_spec = EXCLUDED.schedule_spec \
                 RETURNING ",
                job_columns!()
            ))
            .bind(&registration.name)
            .bind(&registration.schedule_spec)
            .bind(registration.first_run_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            row_to_job(&row)
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
            let row = sqlx::query(
                "UPDATE scheduled_jobs \
                 SET locked_at = NOW(), locked_by = $2, lease_token = lease_token + 1, \
                     last_run_at = NOW() \
                 WHERE name = $1 \
                   AND next_run_at IS NOT NULL AND next_run_at <= NOW() \
                   AND (locked_at IS NULL \
                        OR locked_at <= NOW() - make_interval(secs => $3::double precision)) \
                 RETURNING lease_token, locked_at",
            )
            .bind(&name)
            .bind(&worker_id)
            .bind(lease_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let token: i64 = column(&row, "lease_token")?;
            let acquired_at: DateTime<Utc> = column(&row, "locked_at")?;

            tracing::debug!(job = %name, worker = %worker_id, token, "Lease acquired");
            Ok(Some(Lease {
                job_name: name,
                worker_id,
                token,
                acquired_at,
            }))
        })
    }

    fn renew(&self, lease: &Lease) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        let lease = lease.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE scheduled_jobs SET locked_at = NOW() \
                 WHERE name = $1 AND locked_by = $2 AND lease_token = $3 \
                   AND locked_at IS NOT NULL",
            )
            .bind(&lease.job_name)
            .bind(&lease.worker_id)
            .bind(lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn release(
        &self,
        lease: &Lease,
        completion: JobCompletion,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        let lease = lease.clone();
        Box::pin(async move {
            let (succeeded, error) = match completion.outcome {
                JobOutcome::Succeeded => (true, None),
                JobOutcome::Failed(error) => (false, Some(error)),
            };

            let result = sqlx::query(
                "UPDATE scheduled_jobs \
                 SET locked_at = NULL, locked_by = NULL, \
                     last_finished_at = $4, next_run_at = $5, \
                     fail_count = CASE WHEN $6 THEN 0 ELSE fail_count + 1 END, \
                     last_error = $7 \
                 WHERE name = $1 AND locked_by = $2 AND lease_token = $3 \
                   AND locked_at IS NOT NULL",
            )
            .bind(&lease.job_name)
            .bind(&lease.worker_id)
            .bind(lease.token)
            .bind(completion.finished_at)
            .bind(completion.next_run_at)
            .bind(succeeded)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn get(&self, name: &str) -> BoxFuture<'_, Result<Option<ScheduledJob>, JobStoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM scheduled_jobs WHERE name = $1"
            ))
            .bind(&name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            row.as_ref().map(row_to_job).transpose()
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        Box::pin(async move {
            let rows = sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM scheduled_jobs ORDER BY name"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            rows.iter().map(row_to_job).collect()
        })
    }

    fn list_locked(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        let name = name.map(str::to_string);
        Box::pin(async move { self.select_locked(name).await })
    }

    fn force_unlock(
        &self,
        name: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<ScheduledJob>, JobStoreError>> {
        let name = name.map(str::to_string);
        Box::pin(async move {
            // The CTE snapshot holds the rows as they were before the update.
            let rows = sqlx::query(concat!(
                "WITH locked AS ( \
                     SELECT ",
                job_columns!(),
                " FROM scheduled_jobs \
                     WHERE locked_at IS NOT NULL AND ($1::text IS NULL OR name = $1) \
                     FOR UPDATE \
                 ), cleared AS ( \
                     UPDATE scheduled_jobs j \
                     SET locked_at = NULL, locked_by = NULL, lease_token = j.lease_token + 1 \
                     FROM locked WHERE j.name = locked.name \
                 ) \
                 SELECT * FROM locked ORDER BY name"
            ))
            .bind(name.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobStoreError::DatabaseError(e.to_string()))?;

            let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
            tracing::info!(count = jobs.len(), filter = ?name, "Force-unlocked jobs");
            Ok(jobs)
        })
    }
}
