//! Random-access reads over HTTP range requests.
//!
//! A [`VirtualFile`] turns a remote object into something that can be read at
//! arbitrary offsets, the way a disk image or an archive is read by a
//! filesystem driver. Reads are served from a small pool of long-lived range
//! responses; a read that continues where another stopped reuses its
//! connection instead of paying for a new request.
//!
//! # Architecture
//!
//! This crate follows the three-layer pattern:
//! - `data` - Immutable configuration and counters
//! - [`core`] - Pure transformations: range arithmetic and the retry schedule
//! - `effects` - I/O behind the [`RangeClient`], [`Renewer`] and [`Sleeper`] traits
//!
//! # Key Features
//!
//! - **Bounded Pool**: at most `max_conns` connections per file, LRU eviction
//! - **Forward Reuse**: small forward gaps are read and dropped rather than re-requested
//! - **Bounded Waits**: connect and idle-read timeouts on every connection
//! - **Expiring URLs**: rejected or expiring URLs are renewed once, however many readers notice
//! - **No Partial Results**: a read either fills its buffer (up to end of file) or fails
//!
//! # Example
//!
//! ```
//! use htfs::{HtfsOptions, MemoryClient, VirtualFile};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> htfs::Result<()> {
//! let client = MemoryClient::new(b"hello, range requests".to_vec());
//! let file = VirtualFile::open_with_client(client, "https://example.com/greeting", HtfsOptions::default()).await?;
//!
//! let mut buf = [0u8; 5];
//! file.read_at(&mut buf, 7).await?;
//! assert_eq!(&buf, b"range");
//! # Ok(())
//! # }
//! ```

pub mod core;
mod data;
mod effects;
mod error;

pub use data::{HtfsOptions, PoolOptions, RetryPolicy, Stats, StatsSnapshot, Timeouts};
pub use effects::{
    BodyStream, BoxStream, ConnectionPool, CurrentUrl, Fault, FileInfo, FileReader,
    MemoryClient, Probe, RangeClient, RangeConnection, Renewer, RetryController, RetryRun,
    SignedUrl, Sleeper, SourceResolver, TokioSleeper, VirtualFile,
};

#[cfg(feature = "reqwest")]
pub use effects::ReqwestClient;

pub use error::{Error, ErrorClass, Result, classify_status};
