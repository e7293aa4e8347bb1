//! Common types for Lodestone: errors, retry, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default interval between polls of a pending remote operation
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default deadline for a pending remote operation to reach a terminal state
pub const DEFAULT_OPERATION_DEADLINE_SECS: u64 = 600;

/// Default number of plan steps that may execute concurrently
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
