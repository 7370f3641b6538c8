//! # Courier Runtime
//!
//! The moving parts of Courier: the publisher orchestrator, the lease-locked job
//! scheduler and the jobs it runs.
//!
//! ## Components
//!
//! - [`OutboxPublisher`]: writes the outbox record, publishes, records the outcome
//! - [`JobScheduler`]: claims due jobs under a lease and runs them
//! - [`OutboxSweeper`]: job re-driving undelivered messages
//! - [`OutboxCleanup`]: job purging delivered messages past retention
//! - [`LockRecovery`]: operator tool for stale leases
//! - [`Deduplicated`]: consumer wrapper skipping redeliveries
//!
//! ## Example
//!
//! ```ignore
//! let publisher = OutboxPublisher::new(store, broker, Arc::new(SystemClock));
//! let receipt = publisher
//!     .request_external_action(ExternalAction::new(
//!         "ticket.sales",
//!         "ticket.sale.completed",
//!         json!({ "eventId": "E1", "merchantId": "M1" }),
//!     ))
//!     .await?;
//! ```

pub mod dedup;
pub mod lock_recovery;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod scheduler;
pub mod sweeper;

pub use dedup::Deduplicated;
pub use lock_recovery::{LockRecovery, UnlockReport};
pub use publisher::{ExternalAction, OutboxPublisher, PublishError, PublishReceipt};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use scheduler::{
    JobContext, JobDescriptor, JobError, JobHandler, JobRun, JobScheduler, SchedulerConfig,
};
pub use sweeper::{CLEANUP_JOB, OutboxCleanup, OutboxSweeper, SWEEPER_JOB, SweepReport, SweeperConfig};
