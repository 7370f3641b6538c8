//! PostgreSQL persistence for Courier.
//!
//! Provides [`PostgresOutboxStore`] and [`PostgresJobStore`], the production
//! implementations of the outbox and job store traits from `courier-core`.
//!
//! Every status transition and lease operation is a single conditional `UPDATE`, so
//! concurrent publishers, sweepers and workers never need an application-level lock.
//! Time comes from the database (`NOW()`), which keeps lease ages consistent across
//! workers with skewed clocks.
//!
//! # Example
//!
//! ```no_run
//! use courier_postgres::{PostgresJobStore, PostgresOutboxStore, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/courier", 10).await?;
//! courier_postgres::run_migrations(&pool).await?;
//!
//! let outbox = PostgresOutboxStore::new(pool.clone());
//! let jobs = PostgresJobStore::new(pool);
//! # Ok(())
//! # }
//! ```

mod jobs;
mod outbox;

pub use jobs::PostgresJobStore;
pub use outbox::PostgresOutboxStore;

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;

/// Embedded schema migrations (`migrations/`).
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a connection pool.
///
/// # Errors
///
/// Returns the underlying `sqlx` error if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply all pending migrations.
///
/// # Errors
///
/// Returns [`MigrateError`] if a migration fails or the recorded history diverges.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    tracing::info!("Running database migrations");
    MIGRATOR.run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}

/// Clamp a caller-supplied limit into a `BIGINT` bind.
fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
