//! Courier worker process.
//!
//! This binary:
//! - Connects to `PostgreSQL` and applies migrations
//! - Connects to Redpanda and declares the configured exchanges
//! - Registers the outbox retry sweeper and retention cleanup jobs
//! - Runs the lease-locked scheduler until Ctrl+C / SIGTERM
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d
//! cargo run --bin courier-worker
//! ```

use anyhow::Context;
use courier_core::environment::{Clock, SystemClock};
use courier_core::{JobStore, MessageBroker, OutboxStore, Topology};
use courier_postgres::{PostgresJobStore, PostgresOutboxStore};
use courier_redpanda::RedpandaBroker;
use courier_runtime::{JobScheduler, retry_with_backoff};
use courier_worker::{Config, jobs, telemetry};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing(telemetry::DEFAULT_FILTER);

    let config = Config::from_env();
    let scheduler_config = config.scheduler.runtime();
    tracing::info!(
        redpanda = %config.redpanda.brokers,
        worker_id = %scheduler_config.worker_id,
        "Configuration loaded"
    );

    let _metrics = telemetry::start_metrics(&config.server)?;

    // Persistence
    let reconnect = config.redpanda.reconnect_policy();
    let pool = retry_with_backoff(&reconnect, || {
        courier_postgres::connect(&config.postgres.url, config.postgres.max_connections)
    })
    .await
    .context("connecting to PostgreSQL")?;
    courier_postgres::run_migrations(&pool)
        .await
        .context("running migrations")?;

    // Broker
    let broker = RedpandaBroker::builder()
        .brokers(&config.redpanda.brokers)
        .client_id(&config.redpanda.client_id)
        .compression(&config.redpanda.compression)
        .confirm_timeout(config.redpanda.confirm_timeout())
        .retry_policy(reconnect)
        .build()?;
    broker.connect().await.context("connecting to Redpanda")?;

    let topology = config
        .redpanda
        .exchange_specs()
        .into_iter()
        .fold(Topology::new(), Topology::exchange);
    if !topology.exchanges.is_empty() {
        broker
            .declare_topology(&topology)
            .await
            .context("declaring topology")?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone()));
    let job_store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let broker: Arc<dyn MessageBroker> = Arc::new(broker);

    let table = jobs::job_table(&config.outbox, &outbox, &broker, &clock)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = JobScheduler::new(job_store, clock, table, scheduler_config, shutdown_rx);

    let mut running = tokio::spawn(async move { scheduler.run().await });
    tracing::info!("Courier worker is running; press Ctrl+C to shut down");

    tokio::select! {
        () = shutdown_signal() => {}
        result = &mut running => {
            broker.close().await?;
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("scheduler stopped unexpectedly")),
                Ok(Err(e)) => Err(e).context("scheduler stopped"),
                Err(e) => Err(e).context("scheduler task failed"),
            };
        }
    }

    tracing::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(config.server.shutdown_timeout(), running).await {
        Ok(Ok(Ok(()))) => tracing::info!("Scheduler stopped"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Scheduler stopped with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Scheduler task failed"),
        Err(_) => tracing::warn!("Scheduler did not stop within the shutdown timeout"),
    }

    broker.close().await.context("closing broker")?;
    pool.close().await;
    tracing::info!("Clean shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
