//! In-memory transport.
//!
//! Serves a byte buffer through the [`RangeClient`] interface with
//! configurable chunking, latency and per-request faults. Tests and benches
//! use it to exercise the pool without sockets; it also counts how many
//! response bodies are alive at once, which is the number a real server would
//! see as open connections.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tracing::trace;

use crate::core::ByteRange;
use crate::effects::http::{BodyStream, Probe, RangeClient};
use crate::error::{Error, Result};

/// A failure to inject into one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this HTTP status instead of the data.
    Status(u16),
    /// Send at most one chunk, then fail with a network error.
    Reset,
    /// Accept the request, then never send a byte.
    Stall,
    /// End the body cleanly after this many bytes.
    Truncate(usize),
}

/// Serves `data` as if it were a remote object.
///
/// Requests are numbered from 1 in arrival order, probes included. Cloning
/// shares the object, the fault table and the counters.
///
/// # Examples
///
/// ```
/// use htfs::{Fault, MemoryClient};
///
/// let client = MemoryClient::new(vec![7u8; 1024]).chunk_size(100);
/// client.inject(2, Fault::Status(503));
/// assert_eq!(client.requests(), 0);
/// ```
#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

struct Inner {
    data: Bytes,
    chunk_size: usize,
    latency: Duration,
    accepted: Mutex<Option<String>>,
    faults: Mutex<HashMap<u64, Fault>>,
    requests: AtomicU64,
    open_streams: Arc<AtomicUsize>,
    peak_streams: AtomicUsize,
}

impl MemoryClient {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: data.into(),
                chunk_size: 16 * 1024,
                latency: Duration::ZERO,
                accepted: Mutex::new(None),
                faults: Mutex::new(HashMap::new()),
                requests: AtomicU64::new(0),
                open_streams: Arc::new(AtomicUsize::new(0)),
                peak_streams: AtomicUsize::new(0),
            }),
        }
    }

    /// Size of the chunks a body is split into.
    ///
    /// Must be called before the client is cloned.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.chunk_size = chunk_size.max(1);
        }
        self
    }

    /// Delay before each response.
    ///
    /// Must be called before the client is cloned.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.latency = latency;
        }
        self
    }

    /// Reject every URL but `url` with 403, the way an expired signed URL is
    /// rejected.
    pub fn accept_only(&self, url: impl Into<String>) {
        *lock(&self.inner.accepted) = Some(url.into());
    }

    /// Fail request number `request` with `fault`.
    pub fn inject(&self, request: u64, fault: Fault) {
        lock(&self.inner.faults).insert(request, fault);
    }

    /// Fail the next request with `fault`.
    pub fn fail_next(&self, fault: Fault) {
        self.inject(self.requests() + 1, fault);
    }

    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    /// Requests received so far.
    pub fn requests(&self) -> u64 {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Response bodies currently alive.
    pub fn open_streams(&self) -> usize {
        self.inner.open_streams.load(Ordering::SeqCst)
    }

    /// Most response bodies ever alive at once.
    pub fn peak_streams(&self) -> usize {
        self.inner.peak_streams.load(Ordering::SeqCst)
    }

    async fn admit(&self, url: &str) -> Result<Option<Fault>> {
        let number = self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = lock(&self.inner.faults).remove(&number);
        trace!(number, url, ?fault, "memory request");

        if !self.inner.latency.is_zero() {
            tokio::time::sleep(self.inner.latency).await;
        }

        let rejected = lock(&self.inner.accepted)
            .as_deref()
            .is_some_and(|accepted| accepted != url);
        if rejected {
            return Err(status(403, url));
        }
        match fault {
            Some(Fault::Status(code)) => Err(status(code, url)),
            other => Ok(other),
        }
    }

    fn open_guard(&self) -> OpenGuard {
        let open = self.inner.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_streams.fetch_max(open, Ordering::SeqCst);
        OpenGuard(Arc::clone(&self.inner.open_streams))
    }
}

impl RangeClient for MemoryClient {
    async fn probe(&self, url: &str) -> Result<Probe> {
        if let Some(fault) = self.admit(url).await? {
            return Err(Error::Network(format!("injected {fault:?} during probe")));
        }
        let size = self.inner.data.len() as u64;
        Ok(Probe {
            size,
            etag: Some(format!("\"{size:x}\"")),
            last_modified: None,
        })
    }

    async fn open_range(&self, url: &str, range: ByteRange) -> Result<BodyStream> {
        let fault = self.admit(url).await?;

        let size = self.inner.data.len() as u64;
        if range.start >= size {
            return Err(status(416, url));
        }
        let end = range.end.unwrap_or(size).min(size);
        let mut body = self.inner.data.slice(range.start as usize..end as usize);

        let mut reset = false;
        let mut stall = false;
        match fault {
            Some(Fault::Reset) => {
                body.truncate(self.inner.chunk_size);
                reset = true;
            }
            Some(Fault::Stall) => stall = true,
            Some(Fault::Truncate(n)) => body.truncate(n),
            Some(Fault::Status(_)) | None => {}
        }

        Ok(Box::pin(MemoryBody {
            data: body,
            chunk_size: self.inner.chunk_size,
            reset,
            stall,
            _open: self.open_guard(),
        }))
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryBody {
    data: Bytes,
    chunk_size: usize,
    reset: bool,
    stall: bool,
    _open: OpenGuard,
}

impl Stream for MemoryBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.stall {
            // never woken; the reader's idle timeout ends the wait
            return Poll::Pending;
        }
        if this.data.is_empty() {
            if std::mem::take(&mut this.reset) {
                return Poll::Ready(Some(Err(Error::Network("connection reset by peer".into()))));
            }
            return Poll::Ready(None);
        }
        let n = this.chunk_size.min(this.data.len());
        Poll::Ready(Some(Ok(this.data.split_to(n))))
    }
}

fn status(code: u16, url: &str) -> Error {
    Error::Status {
        status: code,
        url: url.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
