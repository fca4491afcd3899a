use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::effects::{Renewer, Sleeper, TokioSleeper};
use crate::error::{Error, Result};

/// Connection pool tuning.
///
/// # Examples
///
/// ```
/// use htfs::PoolOptions;
///
/// let pool = PoolOptions::default().max_conns(4).max_skip(64 * 1024);
/// assert_eq!(pool.max_conns, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Upper bound on live connections for one file.
    ///
    /// Default: 8
    pub max_conns: usize,

    /// Largest forward gap, in bytes, that an open connection will read and
    /// drop instead of a new range request being issued.
    ///
    /// Default: 1 MiB
    pub max_skip: u64,

    /// Idle connections unused for longer than this are closed rather than
    /// reused.
    ///
    /// Default: 10s
    #[serde(with = "millis")]
    pub stale_after: Duration,

    /// Length cap for each range request. `None` requests everything from the
    /// start offset to the end of the object.
    ///
    /// Default: None
    pub max_range_len: Option<u64>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_conns: 8,
            max_skip: 1024 * 1024,
            stale_after: Duration::from_secs(10),
            max_range_len: None,
        }
    }
}

impl PoolOptions {
    #[must_use]
    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    #[must_use]
    pub fn max_skip(mut self, max_skip: u64) -> Self {
        self.max_skip = max_skip;
        self
    }

    #[must_use]
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn max_range_len(mut self, max_range_len: Option<u64>) -> Self {
        self.max_range_len = max_range_len;
        self
    }
}

/// Transport timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Bound on establishing the TCP/TLS session.
    ///
    /// Default: 30s
    #[serde(with = "millis")]
    pub connect: Duration,

    /// Bound on the silence between two chunks of an open response body.
    /// This is not a total-transfer timeout.
    ///
    /// Default: 30s
    #[serde(with = "millis")]
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            idle: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    /// Bound on waiting for response headers: connecting plus one idle period.
    pub fn first_byte(&self) -> Duration {
        self.connect.saturating_add(self.idle)
    }
}

/// Backoff schedule and attempt budget for one logical operation.
///
/// The delay before retry `n` (1-based) is
/// `min(max_delay, base_delay * multiplier^(n-1))`, spread by `jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    ///
    /// Default: 6
    pub max_attempts: u32,

    /// Default: 100ms
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Default: 2.0
    pub multiplier: f64,

    /// Default: 10s
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Fraction of the delay used as a random spread, in `[0, 1]`.
    /// A value of 0.2 yields delays within ±10% of the nominal one.
    ///
    /// Default: 0.2
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delays, handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Configuration for opening a [`VirtualFile`](crate::VirtualFile).
///
/// # Examples
///
/// ```
/// use htfs::{HtfsOptions, PoolOptions};
/// use std::time::Duration;
///
/// let options = HtfsOptions::default()
///     .dump_stats(true)
///     .pool(PoolOptions::default().max_conns(4))
///     .idle_timeout(Duration::from_secs(10))
///     .header("Authorization", "Bearer token");
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct HtfsOptions {
    /// Log a statistics summary when the file is closed.
    ///
    /// Default: false
    pub dump_stats: bool,

    pub pool: PoolOptions,

    pub timeouts: Timeouts,

    pub retry: RetryPolicy,

    /// Headers sent with every request, including retries.
    ///
    /// Default: empty
    pub headers: Arc<[(String, String)]>,

    /// Source of fresh URLs once the current one is rejected or expires.
    ///
    /// Default: None (an authorization failure is fatal)
    pub renewer: Option<Arc<dyn Renewer>>,

    /// When the initial URL expires, if known.
    ///
    /// Default: None
    pub expires_at: Option<std::time::Instant>,

    /// URLs within this much of their expiry are renewed before use.
    ///
    /// Default: 5s
    pub expiry_margin: Duration,

    /// Where backoff delays are slept.
    ///
    /// Default: [`TokioSleeper`]
    pub sleeper: Arc<dyn Sleeper>,

    /// Parent token; cancelling it aborts every read on the file.
    ///
    /// Default: None
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for HtfsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtfsOptions")
            .field("dump_stats", &self.dump_stats)
            .field("pool", &self.pool)
            .field("timeouts", &self.timeouts)
            .field("retry", &self.retry)
            .field("headers", &self.headers)
            .field("renewer", &self.renewer.as_ref().map(|_| "{ ... }"))
            .field("expires_at", &self.expires_at)
            .field("expiry_margin", &self.expiry_margin)
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl Default for HtfsOptions {
    fn default() -> Self {
        Self {
            dump_stats: false,
            pool: PoolOptions::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            headers: Arc::new([]),
            renewer: None,
            expires_at: None,
            expiry_margin: Duration::from_secs(5),
            sleeper: Arc::new(TokioSleeper),
            cancellation: None,
        }
    }
}

impl HtfsOptions {
    #[must_use]
    pub fn dump_stats(mut self, dump_stats: bool) -> Self {
        self.dump_stats = dump_stats;
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.pool.max_conns = max_conns;
        self
    }

    #[must_use]
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, connect: Duration) -> Self {
        self.timeouts.connect = connect;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.timeouts.idle = idle;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a single custom HTTP header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut headers: Vec<_> = self.headers.iter().cloned().collect();
        headers.push((key.into(), value.into()));
        self.headers = Arc::from(headers);
        self
    }

    /// Replace all custom HTTP headers.
    #[must_use]
    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = Arc::from(headers);
        self
    }

    #[must_use]
    pub fn renewer(mut self, renewer: Arc<dyn Renewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    #[must_use]
    pub fn expires_at(mut self, expires_at: std::time::Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn expiry_margin(mut self, expiry_margin: Duration) -> Self {
        self.expiry_margin = expiry_margin;
        self
    }

    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_conns == 0 {
            return Err(Error::InvalidConfig("max_conns must be at least 1".into()));
        }
        if self.pool.max_range_len == Some(0) {
            return Err(Error::InvalidConfig("max_range_len must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::InvalidConfig(format!(
                "retry jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.timeouts.idle.is_zero() || self.timeouts.connect.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
