//! Operator tool: clear stuck job leases.
//!
//! A worker that crashes mid-run leaves its job locked until the lease times out.
//! This command clears the lease immediately (and bumps the fencing token, so a
//! worker that is in fact still alive cannot overwrite the job afterwards).
//!
//! # Usage
//!
//! ```bash
//! # Unlock every locked job
//! unlock-jobs
//!
//! # Unlock a single job
//! unlock-jobs outbox-retry-sweeper
//!
//! # Only show what is locked
//! unlock-jobs --dry-run
//! ```
//!
//! Exits 0 on success (including when nothing was locked) and 1 when the database
//! cannot be reached or the update fails.

use anyhow::Context;
use clap::Parser;
use courier_postgres::PostgresJobStore;
use courier_runtime::LockRecovery;
use courier_runtime::lock_recovery::describe;
use courier_worker::{Config, telemetry};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "unlock-jobs", version, about = "Clear stuck scheduled-job leases")]
struct Cli {
    /// Only unlock this job; all locked jobs when omitted
    job_name: Option<String>,

    /// Database URL; defaults to `DATABASE_URL`
    #[arg(long)]
    database_url: Option<String>,

    /// List locked jobs without unlocking them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing("warn");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("unlock-jobs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env();
    let url = cli.database_url.unwrap_or(config.postgres.url);

    let pool = courier_postgres::connect(&url, 2)
        .await
        .context("connecting to database")?;
    let recovery = LockRecovery::new(Arc::new(PostgresJobStore::new(pool.clone())));
    let filter = cli.job_name.as_deref();

    if cli.dry_run {
        let locked = recovery
            .list_locked(filter)
            .await
            .context("listing locked jobs")?;
        for job in &locked {
            println!("{}", describe(job));
        }
        println!("{} locked job(s)", locked.len());
    } else {
        let report = recovery.unlock(filter).await.context("unlocking jobs")?;
        println!("{report}");
    }

    pool.close().await;
    Ok(())
}
