//! Prometheus metrics for outbox delivery and job scheduling.
//!
//! Metric families:
//! - `courier_outbox_*`: intents recorded, confirmed, failed, dead-lettered, purged
//! - `courier_scheduler_*`: job runs, failures, lost leases, forced unlocks
//! - `courier_retry_*`: connection-level retries
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut endpoint = MetricsServer::new("0.0.0.0:9464".parse()?);
//! endpoint.start()?;
//! // scrape http://<host>:9464/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Seconds; publish confirms sit at the low end, job runs at the high end.
const DURATION_BUCKETS: &[f64] = &[
    0.002, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0, 30.0, 120.0,
];

pub use metrics::{counter, gauge, histogram};

/// Why the Prometheus endpoint could not come up.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Histogram bucket configuration was rejected
    #[error("Invalid Prometheus exporter settings: {0}")]
    Build(String),
    /// Listener or global recorder could not be installed
    #[error("Could not install Prometheus recorder: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Register metric descriptions, install the global recorder and start the HTTP
    /// listener. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".into()), DURATION_BUCKETS)
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        self.started = true;

        tracing::info!(addr = %self.addr, "Metrics endpoint listening");
        Ok(())
    }

    /// Whether [`start`](Self::start) succeeded.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Address the endpoint listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Describe every `courier_*` metric so the exporter emits HELP lines.
pub fn register_metrics() {
    describe_counter!(
        "courier_outbox_created_total",
        "Outbox messages recorded by the publisher"
    );
    describe_counter!(
        "courier_outbox_duplicates_total",
        "Publish requests answered from an existing idempotency key"
    );
    describe_counter!(
        "courier_outbox_sent_total",
        "Outbox messages confirmed by the broker"
    );
    describe_counter!(
        "courier_outbox_failed_total",
        "Publish attempts that failed and were left for retry"
    );
    describe_counter!(
        "courier_outbox_dead_total",
        "Outbox messages moved to dead"
    );
    describe_counter!(
        "courier_outbox_purged_total",
        "Sent outbox messages removed by retention"
    );
    describe_histogram!(
        "courier_outbox_publish_duration_seconds",
        "Time from publish call to broker confirmation"
    );

    describe_counter!(
        "courier_scheduler_runs_total",
        "Job runs by job and outcome"
    );
    describe_histogram!(
        "courier_scheduler_run_duration_seconds",
        "Job run duration by job"
    );
    describe_counter!(
        "courier_scheduler_leases_lost_total",
        "Lease renewals or releases rejected because the lease was taken over"
    );
    describe_counter!(
        "courier_scheduler_unlocked_total",
        "Leases cleared by lock recovery"
    );

    describe_counter!(
        "courier_retry_attempts_total",
        "Connection-level retry attempts"
    );
    describe_counter!(
        "courier_retry_successes_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!(
        "courier_retry_exhausted_total",
        "Operations that failed after exhausting retries"
    );
}

fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a new outbox message.
    pub fn record_created(exchange: &str) {
        counter!("courier_outbox_created_total", "exchange" => exchange.to_string()).increment(1);
    }

    /// Record a request answered from an existing idempotency key.
    pub fn record_duplicate() {
        counter!("courier_outbox_duplicates_total").increment(1);
    }

    /// Record a confirmed publish.
    pub fn record_sent(exchange: &str, duration: Duration) {
        counter!("courier_outbox_sent_total", "exchange" => exchange.to_string()).increment(1);
        histogram!("courier_outbox_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish attempt.
    pub fn record_failed(exchange: &str) {
        counter!("courier_outbox_failed_total", "exchange" => exchange.to_string()).increment(1);
    }

    /// Record messages moved to dead.
    pub fn record_dead(len: usize) {
        counter!("courier_outbox_dead_total").increment(count(len));
    }

    /// Record purged messages.
    pub fn record_purged(purged: u64) {
        counter!("courier_outbox_purged_total").increment(purged);
    }
}

/// Scheduler metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a finished job run.
    pub fn record_run(job: &str, succeeded: bool, duration: Duration) {
        let outcome = if succeeded { "succeeded" } else { "failed" };
        counter!(
            "courier_scheduler_runs_total",
            "job" => job.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("courier_scheduler_run_duration_seconds", "job" => job.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a lost lease.
    pub fn record_lease_lost(job: &str) {
        counter!("courier_scheduler_leases_lost_total", "job" => job.to_string()).increment(1);
    }

    /// Record leases cleared by lock recovery.
    pub fn record_unlocked(len: usize) {
        counter!("courier_scheduler_unlocked_total").increment(count(len));
    }
}

/// Counters for [`retry_with_predicate`](crate::retry::retry_with_predicate).
pub struct RetryMetrics;

impl RetryMetrics {
    /// A failed attempt that will be retried.
    pub fn record_attempt() {
        counter!("courier_retry_attempts_total").increment(1);
    }

    /// Success that needed at least one retry.
    pub fn record_success() {
        counter!("courier_retry_successes_total").increment(1);
    }

    /// Gave up with the budget spent.
    pub fn record_exhausted() {
        counter!("courier_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_is_idle_until_started() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(!server.is_started());
    }

    #[test]
    fn recorders_are_noops_without_exporter() {
        register_metrics();
        OutboxMetrics::record_sent("ticket.sales", Duration::from_millis(3));
        SchedulerMetrics::record_run("outbox-retry-sweeper", true, Duration::from_millis(10));
        RetryMetrics::record_attempt();
    }
}
