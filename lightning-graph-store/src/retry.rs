//! Bounded exponential backoff for conflicts and throttling.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{Error as BackoffError, ExponentialBackoff, ExponentialBackoffBuilder};
use log::*;

use crate::config::StoreConfig;
use crate::Error;

const MULTIPLIER: f64 = 2.0;

/// Exponential backoff that gives up after a fixed number of attempts
pub struct Attempts {
    remaining: usize,
    inner: ExponentialBackoff,
}

impl Attempts {
    pub fn new(attempts: usize, initial_interval: Duration) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial_interval)
            .with_multiplier(MULTIPLIER)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();
        // the first attempt is not a retry
        Attempts { remaining: attempts.saturating_sub(1), inner }
    }
}

impl Backoff for Attempts {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }
}

/// Run `op` until it succeeds, fails with an error that is not retryable, or
/// runs out of attempts. The last error is returned.
pub async fn with_retry<T, F, Fut>(config: &StoreConfig, what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = Attempts::new(config.retry_attempts, config.retry_initial_interval);
    backoff::future::retry(attempts, move || {
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if e.is_retryable() {
                    info!("{} failed, retrying: {}", what, e);
                    BackoffError::transient(e)
                } else {
                    BackoffError::permanent(e)
                }
            })
        }
    })
    .await
}
