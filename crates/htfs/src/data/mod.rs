//! Immutable configuration and bookkeeping types.
//!
//! Options are plain values built up front and handed to the engine; the
//! only shared mutable piece here is [`Stats`], which is made of atomics.

pub mod options;
pub mod stats;

pub use options::{HtfsOptions, PoolOptions, RetryPolicy, Timeouts};
pub use stats::{Stats, StatsSnapshot};
