//! I/O side of the engine.
//!
//! Everything that touches the network, the clock or shared state lives
//! here, behind the [`RangeClient`], [`Renewer`] and [`Sleeper`] seams so the
//! pool and the retry driver can run against in-memory doubles.

mod conn;
mod file;
mod http;
mod memory;
mod pool;
mod resolver;
mod retry;
mod sleeper;

pub use conn::RangeConnection;
pub use file::{FileInfo, FileReader, VirtualFile};
pub use http::{BodyStream, BoxStream, Probe, RangeClient};
pub use memory::{Fault, MemoryClient};
pub use pool::ConnectionPool;
pub use resolver::{CurrentUrl, Renewer, SignedUrl, SourceResolver};
pub use retry::{RetryController, RetryRun};
pub use sleeper::{Sleeper, TokioSleeper};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
