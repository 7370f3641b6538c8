//! # Courier Core
//!
//! Core traits and types for reliable outbound messaging and lease-locked jobs.
//!
//! This crate has no I/O of its own. It defines the records, the state machines and
//! the storage/broker seams that the runtime drives and the infrastructure crates
//! implement.
//!
//! ## Core Concepts
//!
//! - **Outbox**: persisted publish intents with a `pending → sent | failed → dead` lifecycle
//! - **Envelope**: the JSON wire format every published message travels in
//! - **Broker**: confirmed publish and acknowledged consume over named exchanges
//! - **Jobs**: named periodic tasks that run on at most one worker at a time
//! - **Environment**: injected dependencies such as the [`environment::Clock`]
//!
//! ## Delivery Guarantees
//!
//! - At-least-once: a message may be delivered more than once; consumers
//!   de-duplicate on `correlationId`
//! - No fabricated notifications: nothing is published without a committed outbox row
//! - No silent loss: a failed publish stays in the outbox until it is sent or dead

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod envelope;
pub mod ids;
pub mod job;
pub mod outbox;
pub mod schedule;

pub use broker::{
    BrokerError, ConsumerHandle, Delivery, ExchangeSpec, HandlerOutcome, MessageBroker,
    MessageHandler, QueueBinding, Settlement, Topology,
};
pub use envelope::{Envelope, EnvelopeError};
pub use ids::{CorrelationId, MessageId};
pub use job::{
    JobCompletion, JobOutcome, JobRegistration, JobStore, JobStoreError, Lease, ScheduledJob,
};
pub use outbox::{Inserted, NewOutboxMessage, OutboxError, OutboxMessage, OutboxStatus, OutboxStore};
pub use schedule::{Schedule, ScheduleError};

/// Environment module - Dependency injection traits
///
/// External dependencies are abstracted behind traits and injected into the
/// publisher, scheduler and stores.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
