//! Token bucket rate limiter shared by every call the client makes.
//!
//! Tokens accrue at `requests_per_sec` up to `burst`. Each attempt consumes
//! one token; [`RateLimiter::acquire`] sleeps until one is available.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Token refill rate (requests per second).
    pub requests_per_sec: f64,
    /// Maximum tokens in the bucket.
    pub burst: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: 5.0,
            burst: 5.0,
        }
    }
}

impl RateLimiterConfig {
    /// A budget of `rps` and `burst` per node, scaled to `nodes` nodes.
    pub fn per_node(rps: f64, burst: Option<f64>, nodes: usize) -> Self {
        let n = nodes.max(1) as f64;
        let total = rps * n;
        Self {
            requests_per_sec: total,
            burst: burst.map_or(total, |b| b * n).max(1.0),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket rate limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Returns `None` for a non-positive rate (limiting disabled).
    pub fn new(config: RateLimiterConfig) -> Option<Self> {
        if config.requests_per_sec <= 0.0 {
            return None;
        }
        let burst = config.burst.max(1.0);
        Some(Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            config: RateLimiterConfig { burst, ..config },
        })
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Estimated wait before a token is available.
    pub fn wait_time(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        let deficit = 1.0 - state.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.config.requests_per_sec)
        }
    }

    /// Wait for a token. Returns `false` if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            let wait = self.wait_time().max(Duration::from_millis(1));
            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.requests_per_sec).min(self.config.burst);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_for_zero_rate() {
        assert!(RateLimiter::new(RateLimiterConfig {
            requests_per_sec: 0.0,
            burst: 10.0
        })
        .is_none());
    }

    #[test]
    fn per_node_scaling() {
        let cfg = RateLimiterConfig::per_node(2.0, Some(3.0), 4);
        assert_eq!(cfg.requests_per_sec, 8.0);
        assert_eq!(cfg.burst, 12.0);
        let no_burst = RateLimiterConfig::per_node(2.0, None, 3);
        assert_eq!(no_burst.burst, 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let rl = RateLimiter::new(RateLimiterConfig {
            requests_per_sec: 10.0,
            burst: 3.0,
        })
        .unwrap();
        for _ in 0..3 {
            assert!(rl.try_acquire());
        }
        assert!(!rl.try_acquire());
        let wait = rl.wait_time();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(100), "wait={wait:?}");

        let start = Instant::now();
        assert!(rl.acquire(&CancellationToken::new()).await);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_honours_cancellation() {
        let rl = RateLimiter::new(RateLimiterConfig {
            requests_per_sec: 0.001,
            burst: 1.0,
        })
        .unwrap();
        assert!(rl.try_acquire());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!rl.acquire(&cancel).await);
    }
}
