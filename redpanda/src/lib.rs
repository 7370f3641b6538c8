//! Redpanda broker client for Courier.
//!
//! Implements [`MessageBroker`](courier_core::MessageBroker) on top of rdkafka, so it
//! works with Redpanda or any other Kafka-compatible cluster.
//!
//! # Mapping
//!
//! | Courier          | Kafka                                            |
//! |------------------|--------------------------------------------------|
//! | exchange         | topic                                            |
//! | dead-letter      | `<exchange>.dead-letter` topic                   |
//! | routing key      | record key and `routing-key` header              |
//! | queue            | consumer group                                   |
//! | requeue          | republish with `delivery-count` + 1, then commit |
//!
//! # Delivery Semantics
//!
//! **Publishing** waits for the delivery report of an idempotent producer with
//! `acks=all`. `Ok` means the cluster durably accepted the record; no report within
//! the confirm timeout is [`BrokerError::ConfirmTimeout`](courier_core::BrokerError).
//!
//! **Consuming** is at-least-once. Offsets are committed only after the handler's
//! outcome has been carried out (ack, requeue or dead-letter). Handlers must be
//! idempotent; de-duplicate on the envelope's correlation id.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{ExchangeSpec, MessageBroker, Topology};
//! use courier_redpanda::RedpandaBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder().brokers("localhost:9092").build()?;
//! broker.connect().await?;
//! broker
//!     .declare_topology(&Topology::new().exchange(ExchangeSpec::new("ticket.sales")))
//!     .await?;
//! // ... publish / consume ...
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod broker;
mod consumer;
pub mod headers;

pub use broker::{RedpandaBroker, RedpandaBrokerBuilder};
