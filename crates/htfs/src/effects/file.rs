use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::data::{HtfsOptions, Stats, StatsSnapshot};
use crate::effects::http::RangeClient;
#[cfg(feature = "reqwest")]
use crate::effects::http::ReqwestClient;
use crate::effects::pool::ConnectionPool;
use crate::effects::resolver::{SignedUrl, SourceResolver};
use crate::effects::retry::RetryController;
use crate::error::{Error, Result};

/// Metadata learned when the file was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Last segment of the URL path.
    pub name: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// A remote object read through HTTP range requests.
///
/// `read_at` takes `&self`: share the file between tasks behind an [`Arc`]
/// and read concurrently. Connections are pooled per file and reused by
/// reads that continue where an earlier one stopped.
///
/// # Examples
///
/// ```no_run
/// use htfs::{HtfsOptions, VirtualFile};
///
/// # async fn example() -> htfs::Result<()> {
/// let file = VirtualFile::open(
///     "https://example.com/disk.img",
///     HtfsOptions::default().dump_stats(true),
/// )
/// .await?;
///
/// let mut header = [0u8; 512];
/// file.read_at(&mut header, 0).await?;
/// file.close();
/// # Ok(())
/// # }
/// ```
pub struct VirtualFile<C> {
    pool: ConnectionPool<C>,
    resolver: Arc<SourceResolver>,
    stats: Arc<Stats>,
    info: FileInfo,
    cancel: CancellationToken,
    dump_stats: bool,
    closed: AtomicBool,
}

#[cfg(feature = "reqwest")]
impl VirtualFile<ReqwestClient> {
    /// Open `url` over HTTP(S).
    pub async fn open(url: &str, options: HtfsOptions) -> Result<Self> {
        options.validate()?;
        let client = ReqwestClient::with_options(&options)?;
        Self::open_with_client(client, url, options).await
    }
}

impl<C: RangeClient> VirtualFile<C> {
    /// Open `url` through `client`.
    ///
    /// Probes the object for its size under the retry policy; any failure
    /// that survives it fails the open.
    pub async fn open_with_client(client: C, url: &str, options: HtfsOptions) -> Result<Self> {
        options.validate()?;
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!(
                "unsupported scheme {:?} in {url}",
                parsed.scheme()
            )));
        }

        let stats = Arc::new(Stats::new());
        let mut initial = SignedUrl::new(url);
        initial.expires_at = options.expires_at;
        let resolver = Arc::new(SourceResolver::new(
            initial,
            options.renewer.clone(),
            Arc::clone(&stats),
        ));
        let retry = RetryController::new(
            options.retry.clone(),
            Arc::clone(&options.sleeper),
            Arc::clone(&stats),
            options.expiry_margin,
        );
        let client = Arc::new(client);

        let limit = options.timeouts.first_byte();
        let probe = retry
            .run(&resolver, |current| {
                let client = Arc::clone(&client);
                let stats = Arc::clone(&stats);
                async move {
                    stats.record_request();
                    tokio::time::timeout(limit, client.probe(&current.url))
                        .await
                        .map_err(|_| Error::Timeout(format!("no response within {limit:?}")))?
                }
            })
            .await?;

        let info = FileInfo {
            name: file_name(&parsed),
            size: probe.size,
            etag: probe.etag,
            last_modified: probe.last_modified,
        };
        info!(name = %info.name, size = info.size, "opened remote file");

        let cancel = options
            .cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);

        let pool = ConnectionPool::new(
            client,
            Arc::clone(&resolver),
            retry,
            Arc::clone(&stats),
            options.pool.clone(),
            options.timeouts,
            info.size,
        );

        Ok(Self {
            pool,
            resolver,
            stats,
            info,
            cancel,
            dump_stats: options.dump_stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Fills `buf` completely unless the object ends first; `Ok(0)` means
    /// `offset` is the end of the object. On error nothing is reported as
    /// read, whatever `buf` now holds.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let size = self.info.size;
        if offset > size {
            return Err(Error::OutOfRange { offset, size });
        }
        let len = usize::try_from(size - offset).map_or(buf.len(), |rest| rest.min(buf.len()));
        if len == 0 {
            return Ok(0);
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(offset, len, "read cancelled");
                Err(Error::Cancelled)
            }
            result = self.fill(&mut buf[..len], offset) => result,
        }
    }

    async fn fill(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let at = offset + filled as u64;
            let n = self.pool.read_at(at, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::ShortRead {
                    expected: offset + buf.len() as u64,
                    actual: at,
                });
            }
            filled += n;
        }
        self.stats.add_served(filled as u64);
        Ok(filled)
    }

    /// A sequential cursor over the file, starting at 0.
    pub fn reader(&self) -> FileReader<'_, C> {
        FileReader {
            file: self,
            position: 0,
        }
    }
}

impl<C> VirtualFile<C> {
    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn stat(&self) -> &FileInfo {
        &self.info
    }

    /// Connections currently held for this file.
    pub fn num_conns(&self) -> usize {
        self.pool.num_conns()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The URL reads currently go to; changes when it is renewed.
    pub fn url(&self) -> String {
        self.resolver.current().url.to_string()
    }

    /// Cancelling this token aborts every read on the file.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort in-flight reads, close every connection and refuse further
    /// reads. Closing twice is a no-op.
    pub fn close(&self) -> StatsSnapshot {
        let stats = self.stats.snapshot();
        if self.closed.swap(true, Ordering::AcqRel) {
            return stats;
        }
        self.cancel.cancel();
        self.pool.close();
        if self.dump_stats {
            info!(name = %self.info.name, "htfs stats\n{stats}");
        }
        stats
    }
}

fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .or_else(|| url.host_str())
        .unwrap_or_default()
        .to_string()
}

/// Sequential reads over a [`VirtualFile`].
pub struct FileReader<'a, C> {
    file: &'a VirtualFile<C>,
    position: u64,
}

impl<C: RangeClient> FileReader<'_, C> {
    /// Read at the current position and advance past the bytes read.
    ///
    /// Returns `Ok(0)` at or past the end of the file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.file.size() {
            return Ok(0);
        }
        let n = self.file.read_at(buf, self.position).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Fill `buf` completely or fail with [`Error::OutOfRange`].
    ///
    /// An empty `buf` always succeeds, even past the end.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let size = self.file.size();
        if self.position.saturating_add(buf.len() as u64) > size {
            return Err(Error::OutOfRange {
                offset: self.position,
                size,
            });
        }
        self.read(buf).await.map(|_| ())
    }

    /// Move the cursor. Positions past the end are allowed and read as EOF.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(at) => {
                self.position = at;
                return Ok(at);
            }
            SeekFrom::End(delta) => (self.file.size(), delta),
            SeekFrom::Current(delta) => (self.position, delta),
        };
        self.position = base.checked_add_signed(delta).ok_or(Error::NegativeSeek)?;
        Ok(self.position)
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}
