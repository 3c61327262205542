//! Bounded retry with back-off and an error-kind whitelist.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::caching::{CacheError, CacheResult};

/// Retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Upper bound on invocations of the operation. Zero is treated as one.
    pub max_attempts: usize,
    /// Delay between attempts.
    pub backoff: Duration,
}

/// State threaded through the attempts of one [`RetryPolicy::run_with`].
#[derive(Debug, Default)]
pub struct RetryContext {
    attempt: usize,
    exhausted: bool,
    last_error: Option<CacheError>,
}

impl RetryContext {
    /// The current attempt index, starting at 0.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Aborts the loop after the current attempt, surfacing exhaustion.
    pub fn set_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// The error of the most recent failed attempt.
    pub fn last_error(&self) -> Option<&CacheError> {
        self.last_error.as_ref()
    }
}

impl RetryPolicy {
    /// Invokes `op` until it succeeds, fails with a non-whitelisted error,
    /// or runs out of attempts.
    ///
    /// `state` is handed to every attempt by mutable reborrow, which is how
    /// non-clonable resources like the caller's sink travel through the
    /// loop. Exhaustion (attempts spent, or `set_exhausted` signalled)
    /// yields [`CacheError::ExhaustedRetry`] wrapping the last cause.
    pub async fn run_with<S, T, F>(
        &self,
        retryable: fn(&CacheError) -> bool,
        state: &mut S,
        mut op: F,
    ) -> CacheResult<T>
    where
        F: for<'c> FnMut(&'c mut RetryContext, &'c mut S) -> BoxFuture<'c, CacheResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut ctx = RetryContext::default();
        loop {
            let err = match op(&mut ctx, state).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if ctx.exhausted {
                let cause = ctx.last_error.as_ref().unwrap_or(&err);
                return Err(CacheError::ExhaustedRetry(cause.to_string()));
            }
            if !retryable(&err) {
                return Err(err);
            }
            if ctx.attempt + 1 >= max_attempts {
                return Err(CacheError::ExhaustedRetry(err.to_string()));
            }
            ctx.last_error = Some(err);
            ctx.attempt += 1;
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }
    }
}
