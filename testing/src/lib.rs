//! # Courier Testing
//!
//! Test doubles shared by the Courier crates:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of the outbox and job stores
//! - A scriptable [`MockBroker`] that records every publish
//! - Property-based strategies for outbox inputs
//!
//! ## Wiring a publisher test
//!
//! ```ignore
//! use courier_testing::{InMemoryOutboxStore, MockBroker, test_clock};
//!
//! #[tokio::test]
//! async fn publishes_once() {
//!     let clock = Arc::new(test_clock());
//!     let store = Arc::new(InMemoryOutboxStore::new(clock.clone()));
//!     let broker = Arc::new(MockBroker::new());
//!     // build an OutboxPublisher from the pieces and assert on broker.published()
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

mod broker;
mod job_store;
mod outbox_store;

pub use broker::{MockBroker, PublishedMessage, ScriptedHandler};
pub use job_store::InMemoryJobStore;
pub use outbox_store::InMemoryOutboxStore;

/// Clocks under test control.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Clock frozen at one instant.
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    ///
    /// let frozen = FixedClock::new(chrono::DateTime::UNIX_EPOCH);
    /// assert_eq!(frozen.now().timestamp(), 0);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Freeze at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the code under
    /// test and advance another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// A [`FixedClock`] at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// A [`ManualClock`] starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    #[allow(clippy::expect_used)]
    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).expect("2025-01-01 is representable")
    }
}

/// Shared harness setup.
pub mod helpers {
    /// Install a test subscriber honouring `RUST_LOG`. Safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// `proptest` strategies.
pub mod properties {
    use courier_core::NewOutboxMessage;
    use proptest::prelude::*;

    /// Exchange names of the `domain.entity` form.
    pub fn exchange_name() -> impl Strategy<Value = String> {
        "[a-z]{3,8}\\.[a-z]{3,8}"
    }

    /// Arbitrary publish intents with small JSON payloads.
    pub fn new_outbox_message() -> impl Strategy<Value = NewOutboxMessage> {
        (
            exchange_name(),
            "[a-z]{3,8}\\.[a-z]{3,8}\\.[a-z]{3,8}",
            any::<i64>(),
            proptest::option::of("[a-zA-Z0-9-]{8,16}"),
        )
            .prop_map(|(exchange, routing_key, amount, key)| {
                let message = NewOutboxMessage::new(
                    exchange,
                    routing_key,
                    serde_json::json!({ "amount": amount }),
                );
                match key {
                    Some(key) => message.with_idempotency_key(key),
                    None => message,
                }
            })
    }
}

pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};
