//! Exponential backoff for transient provider failures.
//!
//! The delay schedule is computed here and handed to `backon`, which drives
//! the attempt loop and the sleeps between attempts.

use backon::{BackoffBuilder, Retryable};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use relay_core::config::RetryConfig;

use crate::providers::ProviderError;

/// What [`RetryStrategy::execute`] produced and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempts allowed for one call, including the first.
    pub fn max_attempts(&self) -> u32 {
        if self.config.enabled {
            self.config.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter:
    /// `base * multiplier^retry`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let raw = base * self.config.multiplier.powi(retry as i32);
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// [`delay_for`](Self::delay_for) with symmetric jitter of `±jitter`.
    pub fn jittered_delay(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.delay_for(retry).as_secs_f64();
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        let max = self.config.max_delay.as_secs_f64();
        Duration::from_secs_f64((delay * factor).clamp(0.0, max))
    }

    pub fn should_retry(&self, error: &ProviderError) -> bool {
        match error {
            ProviderError::Timeout(_) => self.config.retry_on_timeout,
            ProviderError::Connection(_) => self.config.retry_on_connection,
            ProviderError::RateLimited { .. } | ProviderError::ApiError { .. } => error
                .status()
                .is_some_and(|s| self.config.retry_on_status.contains(&s)),
            ProviderError::ParseError(_)
            | ProviderError::AuthError
            | ProviderError::NotConfigured(_) => false,
        }
    }

    fn schedule(&self) -> Schedule {
        let mut rng = rand::thread_rng();
        let delays = (0..self.max_attempts().saturating_sub(1))
            .map(|retry| self.jittered_delay(retry, &mut rng))
            .collect();
        Schedule { delays }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is surfaced.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = AtomicU32::new(0);
        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            op()
        })
        .retry(self.schedule())
        .sleep(tokio::time::sleep)
        .when(|e| self.should_retry(e))
        .notify(|e, delay| {
            tracing::debug!(error = %e, delay = ?delay, "retrying provider call");
        })
        .await;

        RetryOutcome {
            result,
            attempts: attempts.load(Ordering::Relaxed),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Precomputed delays fed to `backon`.
#[derive(Debug, Clone)]
struct Schedule {
    delays: Vec<Duration>,
}

impl BackoffBuilder for Schedule {
    type Backoff = std::vec::IntoIter<Duration>;

    fn build(self) -> Self::Backoff {
        self.delays.into_iter()
    }
}
