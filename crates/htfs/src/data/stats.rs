//! Per-file diagnostic counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters owned by one [`VirtualFile`](crate::VirtualFile).
#[derive(Debug, Default)]
pub struct Stats {
    bytes_served: AtomicU64,
    bytes_discarded: AtomicU64,
    requests: AtomicU64,
    conns_opened: AtomicU64,
    conns_reused: AtomicU64,
    conns_evicted: AtomicU64,
    conns_discarded: AtomicU64,
    peak_conns: AtomicU64,
    retries: AtomicU64,
    renewals: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_served(&self, n: u64) {
        self.bytes_served.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_discarded(&self, n: u64) {
        self.bytes_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open(&self) {
        self.conns_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reuse(&self) {
        self.conns_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evict(&self) {
        self.conns_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.conns_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_live(&self, live: usize) {
        self.peak_conns.fetch_max(live as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            conns_opened: self.conns_opened.load(Ordering::Relaxed),
            conns_reused: self.conns_reused.load(Ordering::Relaxed),
            conns_evicted: self.conns_evicted.load(Ordering::Relaxed),
            conns_discarded: self.conns_discarded.load(Ordering::Relaxed),
            peak_conns: self.peak_conns.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Bytes handed back to callers.
    pub bytes_served: u64,
    /// Bytes read and dropped to move a connection forward.
    pub bytes_discarded: u64,
    /// HTTP requests issued, probe included.
    pub requests: u64,
    pub conns_opened: u64,
    pub conns_reused: u64,
    /// Idle connections closed to make room or because they went stale.
    pub conns_evicted: u64,
    /// Connections dropped after an error or once exhausted.
    pub conns_discarded: u64,
    pub peak_conns: u64,
    pub retries: u64,
    pub renewals: u64,
}

impl StatsSnapshot {
    /// Fraction of reads served by an already-open connection.
    pub fn reuse_ratio(&self) -> Option<f64> {
        let total = self.conns_opened + self.conns_reused;
        if total == 0 {
            None
        } else {
            Some(self.conns_reused as f64 / total as f64)
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "served {} bytes ({} discarded by forward skips)",
            self.bytes_served, self.bytes_discarded
        )?;
        writeln!(f, "issued {} requests", self.requests)?;
        writeln!(
            f,
            "connections: {} opened, {} reused, {} evicted, {} discarded, {} peak",
            self.conns_opened,
            self.conns_reused,
            self.conns_evicted,
            self.conns_discarded,
            self.peak_conns
        )?;
        write!(f, "{} retries, {} URL renewals", self.retries, self.renewals)
    }
}
