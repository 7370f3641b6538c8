//! The worker's static job table.

use crate::config::OutboxConfig;
use courier_core::environment::Clock;
use courier_core::{MessageBroker, OutboxStore, Schedule, ScheduleError};
use courier_runtime::{CLEANUP_JOB, JobDescriptor, OutboxCleanup, OutboxSweeper, SWEEPER_JOB};
use std::sync::Arc;

/// Build the jobs every worker registers: the outbox retry sweeper and the
/// retention cleanup.
///
/// # Errors
///
/// Returns [`ScheduleError`] if a configured schedule spec does not parse.
pub fn job_table(
    outbox: &OutboxConfig,
    store: &Arc<dyn OutboxStore>,
    broker: &Arc<dyn MessageBroker>,
    clock: &Arc<dyn Clock>,
) -> Result<Vec<JobDescriptor>, ScheduleError> {
    let sweep_schedule: Schedule = outbox.sweep_schedule.parse()?;
    let cleanup_schedule: Schedule = outbox.cleanup_schedule.parse()?;

    let sweeper = OutboxSweeper::new(
        Arc::clone(store),
        Arc::clone(broker),
        Arc::clone(clock),
        outbox.sweeper(),
    );
    let cleanup = OutboxCleanup::new(Arc::clone(store), Arc::clone(clock), outbox.retention());

    Ok(vec![
        JobDescriptor::new(SWEEPER_JOB, sweep_schedule, Arc::new(sweeper)),
        JobDescriptor::new(CLEANUP_JOB, cleanup_schedule, Arc::new(cleanup)),
    ])
}
