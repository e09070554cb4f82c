//! Exponential backoff retry loop with cancellation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, counting the first try.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay after the `attempt`-th failure (1-based), or `None` when no
    /// attempts remain.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.config.max_attempts {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-transient error; returned on first sight.
    Permanent(E),
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// The cancellation token fired.
    Cancelled,
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or is
/// cancelled. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            r = op(attempt) => r,
        };
        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => match policy.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying request"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tracing::error!(attempt, error = %e, "max retries reached");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
            },
            Err(e) => return Err(RetryError::Permanent(e)),
        }
    }
}
