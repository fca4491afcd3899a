use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::{RetryDecision, RetryState, jittered};
use crate::data::{RetryPolicy, Stats};
use crate::effects::resolver::{CurrentUrl, SourceResolver};
use crate::effects::sleeper::Sleeper;
use crate::error::{Error, ErrorClass, Result};

/// Drives [`RetryState`] against real time and a [`SourceResolver`].
pub struct RetryController {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<Stats>,
    expiry_margin: Duration,
}

impl RetryController {
    pub fn new(
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        stats: Arc<Stats>,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            policy,
            sleeper,
            stats,
            expiry_margin,
        }
    }

    /// Start a logical operation. Use this when the attempt borrows data that
    /// a closure could not hand out repeatedly; otherwise prefer [`run`](Self::run).
    pub fn begin<'a>(&'a self, resolver: &'a SourceResolver) -> RetryRun<'a> {
        RetryRun {
            controller: self,
            resolver,
            state: RetryState::new(&self.policy),
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, resolver: &SourceResolver, mut op: F) -> Result<T>
    where
        F: FnMut(CurrentUrl) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut run = self.begin(resolver);
        loop {
            let url = run.url().await?;
            match op(url.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => run.recover(error, &url).await?,
            }
        }
    }
}

/// One logical operation in progress.
pub struct RetryRun<'a> {
    controller: &'a RetryController,
    resolver: &'a SourceResolver,
    state: RetryState<'a>,
}

impl RetryRun<'_> {
    /// URL for the next attempt; renewed first when it is about to expire.
    ///
    /// A generation is renewed ahead of time at most once. A URL that came
    /// from such a renewal is used until the server rejects it.
    pub async fn url(&mut self) -> Result<CurrentUrl> {
        let current = self.resolver.current();
        if !self.resolver.can_renew() || !current.is_expired(self.controller.expiry_margin) {
            return Ok(current);
        }
        if self.resolver.was_renewed_early(&current) {
            if current.is_expired(Duration::ZERO) {
                warn!(generation = current.generation, "using expired URL");
            }
            return Ok(current);
        }
        debug!(generation = current.generation, "URL about to expire, renewing");
        self.resolver.renew_early(&current).await
    }

    /// Handle a failed attempt made with `used`.
    ///
    /// `Ok(())` means another attempt should be made; an `Err` is final.
    pub async fn recover(&mut self, error: Error, used: &CurrentUrl) -> Result<()> {
        let class = error.class();
        match self.state.on_failure(class) {
            RetryDecision::GiveUp if class != ErrorClass::Fatal && self.state.is_exhausted() => {
                warn!(attempts = self.state.attempts(), %error, "retry budget exhausted");
                Err(Error::RetriesExhausted {
                    attempts: self.state.attempts(),
                    last: Box::new(error),
                })
            }
            RetryDecision::GiveUp => Err(error),
            RetryDecision::Renew => {
                warn!(attempt = self.state.attempts(), %error, "URL rejected, renewing");
                self.controller.stats.record_retry();
                self.resolver.renew(used).await?;
                Ok(())
            }
            RetryDecision::Backoff(delay) => {
                let delay = jittered(delay, self.controller.policy.jitter, rand::random::<f64>());
                warn!(attempt = self.state.attempts(), ?delay, %error, "retrying");
                self.controller.stats.record_retry();
                self.controller.sleeper.sleep(delay).await;
                Ok(())
            }
        }
    }
}
