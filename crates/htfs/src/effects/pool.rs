//! Bounded set of range connections for one remote object.
//!
//! At most `max_conns` connections exist at any time, counting the idle ones,
//! the checked-out ones and slots reserved for connections being opened. A
//! connection is used by one read at a time; it goes back to the idle list
//! only after a read completes on it, so a connection that saw an error is
//! never handed out again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::core::request_end;
use crate::data::{PoolOptions, Stats, Timeouts};
use crate::effects::conn::RangeConnection;
use crate::effects::http::RangeClient;
use crate::effects::resolver::{CurrentUrl, SourceResolver};
use crate::effects::retry::RetryController;
use crate::error::{Error, Result};

pub struct ConnectionPool<C> {
    client: Arc<C>,
    resolver: Arc<SourceResolver>,
    retry: RetryController,
    stats: Arc<Stats>,
    options: PoolOptions,
    timeouts: Timeouts,
    size: u64,
    state: Mutex<PoolState>,
    available: Notify,
    next_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<RangeConnection>,
    /// Idle plus checked out plus reserved.
    live: usize,
    closed: bool,
}

impl<C: RangeClient> ConnectionPool<C> {
    pub fn new(
        client: Arc<C>,
        resolver: Arc<SourceResolver>,
        retry: RetryController,
        stats: Arc<Stats>,
        options: PoolOptions,
        timeouts: Timeouts,
        size: u64,
    ) -> Self {
        Self {
            client,
            resolver,
            retry,
            stats,
            options,
            timeouts,
            size,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Read at most `buf.len()` bytes at `offset` from a single connection.
    ///
    /// Returns fewer bytes only when the connection's range ends first;
    /// `offset` must be below the object size and `buf` non-empty. Failed
    /// attempts are retried on a fresh connection; `buf` holds no partial
    /// data from them once this returns.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut run = self.retry.begin(&self.resolver);
        loop {
            let url = run.url().await?;
            match self.read_once(&url, offset, buf).await {
                Ok(n) => return Ok(n),
                Err(error) => run.recover(error, &url).await?,
            }
        }
    }

    async fn read_once(&self, url: &CurrentUrl, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut checkout = self.acquire(offset).await?;

        let conn = match checkout.conn.take() {
            Some(conn) => checkout.conn.insert(conn),
            None => {
                let end = request_end(offset, self.size, self.options.max_range_len);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.stats.record_request();
                let conn =
                    RangeConnection::open(&*self.client, &url.url, id, offset, end, &self.timeouts)
                        .await?;
                self.stats.record_open();
                debug!(id, offset, end, generation = url.generation, "opened connection");
                checkout.conn.insert(conn)
            }
        };

        let n = conn
            .read_at(offset, buf, self.timeouts.idle, &self.stats)
            .await?;
        checkout.checkin();
        Ok(n)
    }

    /// Take a connection that serves `offset`, or a slot to open one in.
    async fn acquire(&self, offset: u64) -> Result<Checkout<'_, C>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(Error::Closed);
                }
                self.sweep_stale(&mut state);

                let reusable = state
                    .idle
                    .iter()
                    .enumerate()
                    .filter_map(|(i, conn)| {
                        conn.skip_to(offset, self.options.max_skip)
                            .map(|skip| (i, skip))
                    })
                    .min_by_key(|&(_, skip)| skip);
                if let Some((i, skip)) = reusable {
                    let conn = state.idle.swap_remove(i);
                    self.stats.record_reuse();
                    trace!(id = conn.id(), offset, skip, "reusing connection");
                    return Ok(Checkout::new(self, Some(conn)));
                }

                if state.live < self.options.max_conns {
                    state.live += 1;
                    self.stats.record_live(state.live);
                    return Ok(Checkout::new(self, None));
                }

                let lru = state
                    .idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, conn)| conn.last_used())
                    .map(|(i, _)| i);
                if let Some(i) = lru {
                    // the evicted connection's slot passes to the caller
                    let evicted = state.idle.swap_remove(i);
                    drop(state);
                    self.stats.record_evict();
                    debug!(
                        id = evicted.id(),
                        cursor = evicted.cursor(),
                        "evicting idle connection"
                    );
                    drop(evicted);
                    return Ok(Checkout::new(self, None));
                }

                notified.as_mut().enable();
            }
            trace!(offset, "all connections busy, waiting");
            notified.await;
        }
    }

    /// Close idle connections unused for longer than `stale_after`.
    ///
    /// Runs under the state lock so the freed slots cannot be refilled before
    /// the old sockets are gone.
    fn sweep_stale(&self, state: &mut PoolState) {
        let stale_after = self.options.stale_after;
        let before = state.idle.len();
        state.idle.retain(|conn| {
            let stale = conn.last_used().elapsed() > stale_after;
            if stale {
                self.stats.record_evict();
                debug!(id = conn.id(), "closing stale connection");
            }
            !stale
        });
        state.live -= before - state.idle.len();
    }
}

impl<C> ConnectionPool<C> {
    /// Live connections: idle, checked out, or being opened.
    pub fn num_conns(&self) -> usize {
        self.lock().live
    }

    /// Drop idle connections and refuse new checkouts.
    ///
    /// Connections checked out at this point are closed when their read ends.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            idle
        };
        debug!(closed = idle.len(), "pool closed");
        drop(idle);
        self.available.notify_waiters();
    }

    fn discard(&self, conn: RangeConnection) {
        self.stats.record_discard();
        debug!(
            id = conn.id(),
            cursor = conn.cursor(),
            spent = conn.is_spent(),
            "discarding connection"
        );
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one pool slot.
///
/// Dropping it without [`checkin`](Self::checkin) (an error, a panic, a
/// cancelled read) closes the connection and frees the slot.
struct Checkout<'p, C> {
    pool: &'p ConnectionPool<C>,
    conn: Option<RangeConnection>,
    keep: bool,
}

impl<'p, C> Checkout<'p, C> {
    fn new(pool: &'p ConnectionPool<C>, conn: Option<RangeConnection>) -> Self {
        Self {
            pool,
            conn,
            keep: false,
        }
    }

    /// Return the connection for reuse after a successful read.
    fn checkin(mut self) {
        self.keep = true;
    }
}

impl<C> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        let mut conn = self.conn.take();
        // closed before the slot is freed, so a waiter never opens alongside it
        if let Some(unusable) = conn.take_if(|c| !self.keep || c.is_spent()) {
            self.pool.discard(unusable);
        }
        let leftover = {
            let mut state = self.pool.lock();
            match conn {
                Some(mut reusable) if !state.closed => {
                    reusable.touch();
                    state.idle.push(reusable);
                    None
                }
                other => {
                    state.live -= 1;
                    other
                }
            }
        };
        if let Some(conn) = leftover {
            self.pool.discard(conn);
        }
        self.pool.available.notify_waiters();
    }
}
