//! # queuectl-core
//!
//! The job lifecycle engine and leasing protocol at the heart of QueueCTL: a
//! persistent background job queue whose jobs are leased by one of several
//! worker processes racing a shared embedded database, executed as opaque
//! shell commands, and driven through a state machine with bounded retry,
//! exponential backoff, and a terminal dead-letter sink.
//!
//! This crate is storage-agnostic: it defines the [`Store`] trait the
//! leasing predicates and lifecycle transitions are expressed against, and
//! the [`LifecycleManager`] that is the sole writer of job state outside of
//! the store's own compare-and-swap leases. `queuectl-sqlite` provides the
//! concrete embedded-SQL implementation.

mod clock;
mod config;
mod error;
mod lifecycle;
mod model;
mod store;

pub use clock::{format_timestamp, parse_timestamp, Clock, SystemClock};
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use lifecycle::LifecycleManager;
pub use model::{Job, JobState, JobStats, JobUpdate};
pub use store::Store;
