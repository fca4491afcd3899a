//! URL bookkeeping for expiring (signed) URLs.
//!
//! The resolver caches the last known-good URL and tags it with a
//! generation number. Callers that see the URL rejected hand back the
//! snapshot they used; only the first of them for a given generation reaches
//! the [`Renewer`], everybody else gets the URL that renewal produced, or
//! the error it failed with.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::data::Stats;
use crate::error::{Error, Result};

/// A URL handed out by an upstream authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    /// When the URL stops being accepted, if known.
    pub expires_at: Option<Instant>,
}

impl SignedUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn expires_at(mut self, at: Instant) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Capability to obtain a fresh URL for the same object.
pub trait Renewer: Send + Sync {
    fn renew(&self) -> BoxFuture<'_, Result<SignedUrl>>;
}

impl<F, Fut> Renewer for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<SignedUrl>> + Send + 'static,
{
    fn renew(&self) -> BoxFuture<'_, Result<SignedUrl>> {
        Box::pin(self())
    }
}

/// Snapshot of the resolver's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUrl {
    pub url: Arc<str>,
    /// Bumped on every successful renewal.
    pub generation: u64,
    pub expires_at: Option<Instant>,
}

impl CurrentUrl {
    /// True when the URL expires within `margin` from now.
    pub fn is_expired(&self, margin: Duration) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() + margin >= at)
    }
}

pub struct SourceResolver {
    state: Mutex<ResolverState>,
    renewer: Option<Arc<dyn Renewer>>,
    renewing: tokio::sync::Mutex<()>,
    stats: Arc<Stats>,
}

struct ResolverState {
    current: CurrentUrl,
    /// Renewal attempts that have run to completion, successful or not.
    attempts: u64,
    /// Why the last attempt failed; cleared by a successful one.
    last_failure: Option<String>,
    /// Generation produced by a renewal made ahead of expiry.
    renewed_early: Option<u64>,
}

impl SourceResolver {
    pub fn new(
        initial: SignedUrl,
        renewer: Option<Arc<dyn Renewer>>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            state: Mutex::new(ResolverState {
                current: CurrentUrl {
                    url: Arc::from(initial.url),
                    generation: 0,
                    expires_at: initial.expires_at,
                },
                attempts: 0,
                last_failure: None,
                renewed_early: None,
            }),
            renewer,
            renewing: tokio::sync::Mutex::new(()),
            stats,
        }
    }

    /// The last known-good URL; never touches the network.
    pub fn current(&self) -> CurrentUrl {
        self.lock().current.clone()
    }

    pub fn can_renew(&self) -> bool {
        self.renewer.is_some()
    }

    /// `url` came from a renewal made before it was needed, so another
    /// early renewal would not buy any time.
    pub fn was_renewed_early(&self, url: &CurrentUrl) -> bool {
        self.lock().renewed_early == Some(url.generation)
    }

    /// Replace `stale` with a fresh URL.
    ///
    /// Concurrent calls for the same generation collapse into a single call
    /// to the renewer, and share its outcome whether it succeeded or failed.
    pub async fn renew(&self, stale: &CurrentUrl) -> Result<CurrentUrl> {
        self.renew_with(stale, false).await
    }

    /// Like [`renew`](Self::renew), for a URL that is close to expiry but
    /// has not been rejected yet.
    pub async fn renew_early(&self, stale: &CurrentUrl) -> Result<CurrentUrl> {
        self.renew_with(stale, true).await
    }

    async fn renew_with(&self, stale: &CurrentUrl, early: bool) -> Result<CurrentUrl> {
        let seen = self.lock().attempts;
        let _renewing = self.renewing.lock().await;

        {
            let state = self.lock();
            if state.current.generation > stale.generation {
                return Ok(state.current.clone());
            }
            // an attempt for this generation failed while we queued
            let queued = state.attempts > seen;
            if let Some(reason) = state.last_failure.as_ref().filter(|_| queued) {
                debug!(generation = stale.generation, "sharing failed renewal");
                return Err(Error::Renewal(reason.clone()));
            }
        }

        let Some(renewer) = &self.renewer else {
            return Err(Error::Renewal(format!(
                "{} was rejected and no renewer is configured",
                stale.url
            )));
        };

        let signed = match Self::fetch(renewer.as_ref()).await {
            Ok(signed) => signed,
            Err(reason) => {
                warn!(generation = stale.generation, %reason, "renewal failed");
                let mut state = self.lock();
                state.attempts += 1;
                state.last_failure = Some(reason.clone());
                return Err(Error::Renewal(reason));
            }
        };

        self.stats.record_renewal();

        let mut state = self.lock();
        state.attempts += 1;
        state.last_failure = None;
        state.current = CurrentUrl {
            url: Arc::from(signed.url),
            generation: state.current.generation + 1,
            expires_at: signed.expires_at,
        };
        state.renewed_early = early.then_some(state.current.generation);

        let current = state.current.clone();
        if current.is_expired(Duration::ZERO) {
            warn!(generation = current.generation, "renewed URL is already expired");
        } else {
            info!(generation = current.generation, early, "renewed URL");
        }
        Ok(current)
    }

    /// Ask the renewer for a URL; the error is the reason it failed.
    async fn fetch(renewer: &dyn Renewer) -> std::result::Result<SignedUrl, String> {
        let signed = renewer.renew().await.map_err(|e| match e {
            Error::Renewal(reason) => reason,
            other => other.to_string(),
        })?;
        url::Url::parse(&signed.url)
            .map_err(|e| format!("renewer returned an invalid URL: {e}"))?;
        Ok(signed)
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
