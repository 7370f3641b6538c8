//! Retry sweeper and retention cleanup, both run as scheduled jobs.

use crate::metrics::OutboxMetrics;
use crate::publisher::{DeliveryOutcome, deliver};
use crate::scheduler::{JobContext, JobError, JobHandler};
use courier_core::environment::Clock;
use courier_core::{MessageBroker, OutboxError, OutboxStore};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Job name the sweeper is registered under.
pub const SWEEPER_JOB: &str = "outbox-retry-sweeper";

/// Job name the cleanup is registered under.
pub const CLEANUP_JOB: &str = "outbox-cleanup";

/// Sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Attempts after which a message is dead
    pub max_attempts: u32,
    /// Minimum age of the last activity before a message is retried
    pub retry_after: Duration,
    /// Messages retried per run
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_after: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates re-published
    pub retried: usize,
    /// Of those, confirmed
    pub sent: usize,
    /// Of those, failed again and left for the next sweep
    pub failed: usize,
    /// Messages moved to dead (exhausted before the sweep or terminal during it)
    pub dead: usize,
}

/// Re-drives undelivered outbox messages through the broker.
#[derive(Clone)]
pub struct OutboxSweeper {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl OutboxSweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
        }
    }

    /// Run one sweep to completion.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the store cannot be queried.
    pub async fn sweep(&self) -> Result<SweepReport, OutboxError> {
        self.sweep_while(|| true).await
    }

    async fn sweep_while(
        &self,
        keep_going: impl Fn() -> bool + Send + Sync,
    ) -> Result<SweepReport, OutboxError> {
        let mut report = SweepReport::default();

        let exhausted = self
            .store
            .dead_letter_exhausted(self.config.max_attempts)
            .await?;
        for message in &exhausted {
            tracing::warn!(
                message_id = %message.message_id,
                correlation_id = %message.correlation_id,
                exchange = %message.exchange,
                attempts = message.attempts,
                error = message.error.as_deref().unwrap_or_default(),
                "Message exhausted its retries and is dead"
            );
        }
        OutboxMetrics::record_dead(exhausted.len());
        report.dead += exhausted.len();

        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.retry_after).unwrap_or_default();
        let candidates = self
            .store
            .get_retry_candidates(cutoff, self.config.max_attempts, self.config.batch_size)
            .await?;

        for message in &candidates {
            if !keep_going() {
                tracing::info!(remaining = candidates.len() - report.retried, "Sweep interrupted");
                break;
            }
            report.retried += 1;
            match deliver(
                self.store.as_ref(),
                self.broker.as_ref(),
                self.clock.as_ref(),
                message,
            )
            .await
            {
                DeliveryOutcome::Sent => report.sent += 1,
                DeliveryOutcome::Failed(_) => report.failed += 1,
                DeliveryOutcome::Dead(_) => report.dead += 1,
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                retried = report.retried,
                sent = report.sent,
                failed = report.failed,
                dead = report.dead,
                "Outbox sweep finished"
            );
        }
        Ok(report)
    }
}

impl JobHandler for OutboxSweeper {
    fn run<'a>(&'a self, ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            self.sweep_while(|| !ctx.is_lease_lost() && !ctx.is_shutting_down())
                .await?;
            ctx.ensure_lease()
        })
    }
}

/// Deletes sent messages older than the retention window.
#[derive(Clone)]
pub struct OutboxCleanup {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl OutboxCleanup {
    /// Create a cleanup job keeping sent messages for `retention`.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    /// Purge once. Returns the number of messages removed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the delete fails.
    pub async fn purge(&self) -> Result<u64, OutboxError> {
        let older_than =
            self.clock.now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let purged = self.store.purge_sent(older_than).await?;
        OutboxMetrics::record_purged(purged);
        tracing::info!(purged, %older_than, "Purged sent outbox messages");
        Ok(purged)
    }
}

impl JobHandler for OutboxCleanup {
    fn run<'a>(&'a self, _ctx: &'a JobContext) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            self.purge().await?;
            Ok(())
        })
    }
}
