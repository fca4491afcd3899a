//! Pure logic for the engine.
//!
//! Nothing in here performs I/O or sleeps: range arithmetic, header parsing
//! and the retry schedule are plain functions over values, so they can be
//! tested without a network or a clock.

mod range;
mod retry;

pub use range::{ByteRange, ContentRange, parse_content_range, request_end, skip_distance};
pub use retry::{RetryDecision, RetryState, jittered, retry_delay};
