//! Courier worker: configuration, telemetry and the job table.
//!
//! The binaries in this crate wire the library crates together:
//!
//! - `courier-worker` runs the lease-locked scheduler with the outbox retry sweeper
//!   and retention cleanup jobs.
//! - `unlock-jobs` clears stuck leases left behind by crashed workers.

pub mod config;
pub mod jobs;
pub mod telemetry;

pub use config::Config;
