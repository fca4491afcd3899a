use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::trace;

use crate::core::{ByteRange, skip_distance};
use crate::data::{Stats, Timeouts};
use crate::effects::http::{BodyStream, RangeClient};
use crate::error::{Error, Result};

/// One open range response, consumed strictly forward.
pub struct RangeConnection {
    id: u64,
    cursor: u64,
    end: u64,
    body: BodyStream,
    pending: Bytes,
    last_used: Instant,
}

impl RangeConnection {
    /// Request `[start, end)` from `url`.
    ///
    /// Waiting for the response is bounded by [`Timeouts::first_byte`]
    /// whatever the client does on its own.
    pub async fn open<C: RangeClient>(
        client: &C,
        url: &str,
        id: u64,
        start: u64,
        end: u64,
        timeouts: &Timeouts,
    ) -> Result<Self> {
        let limit = timeouts.first_byte();
        let request = client.open_range(url, ByteRange::bounded(start, end));
        let body = tokio::time::timeout(limit, request)
            .await
            .map_err(|_| Error::Timeout(format!("no response within {limit:?}")))??;

        Ok(Self {
            id,
            cursor: start,
            end,
            body,
            pending: Bytes::new(),
            last_used: Instant::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next byte the connection will yield.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Everything up to `end` has been consumed.
    pub fn is_spent(&self) -> bool {
        self.cursor >= self.end
    }

    /// Bytes to drop before `offset` can be served, or `None` if it cannot.
    pub fn skip_to(&self, offset: u64, max_skip: u64) -> Option<u64> {
        skip_distance(self.cursor, self.end, offset, max_skip)
    }

    /// Move to `offset`, then copy into `buf` until it is full or the
    /// connection reaches its end.
    ///
    /// Every wait for a chunk is bounded by `idle`. On error the connection
    /// is in an unknown position and must not be used again.
    pub async fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        idle: Duration,
        stats: &Stats,
    ) -> Result<usize> {
        if offset < self.cursor || offset >= self.end {
            return Err(Error::OutOfRange {
                offset,
                size: self.end,
            });
        }

        let skip = offset - self.cursor;
        while self.cursor < offset {
            self.fill_pending(idle).await?;
            let n = (self.pending.len() as u64).min(offset - self.cursor);
            self.pending.advance(n as usize);
            self.cursor += n;
            stats.add_discarded(n);
        }
        if skip > 0 {
            trace!(id = self.id, skip, "skipped forward");
        }

        let want = (buf.len() as u64).min(self.end - self.cursor) as usize;
        let mut filled = 0;
        while filled < want {
            self.fill_pending(idle).await?;
            let n = self.pending.len().min(want - filled);
            buf[filled..filled + n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            self.cursor += n as u64;
            filled += n;
        }

        self.last_used = Instant::now();
        Ok(filled)
    }

    /// Refresh the access time without reading.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    async fn fill_pending(&mut self, idle: Duration) -> Result<()> {
        while self.pending.is_empty() {
            match tokio::time::timeout(idle, self.body.next()).await {
                Err(_) => return Err(Error::IdleTimeout { after: idle }),
                Ok(None) => {
                    return Err(Error::ShortRead {
                        expected: self.end,
                        actual: self.cursor,
                    });
                }
                Ok(Some(chunk)) => self.pending = chunk?,
            }
        }
        Ok(())
    }
}
