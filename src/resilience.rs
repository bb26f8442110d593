//! Resilience utilities: retry backoff and rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff schedule
//! - [`Backoff`]: Per-engine failure tracker built on a schedule
//! - [`RateLimiter`]: Token bucket throttling handler calls
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use replication_protocol::resilience::{Backoff, RateLimiter, RateLimitConfig, RetryConfig};
//!
//! // Rate limit: max 50 handler calls/sec with burst of 10
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Backoff: 1s, 2s, 4s, ... capped, reset after success
//! let mut backoff = Backoff::new(RetryConfig::default());
//! let delay = backoff.next_delay();
//! tokio::time::sleep(delay).await;
//! backoff.reset();
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule for retrying failed engine cycles.
///
/// There is no attempt budget: a failing engine retries until canceled,
/// waiting `max_delay` between attempts once the cap is reached.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast retries for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// ```text
    /// Attempt  Delay (initial=5s, factor=2, max=300s)
    /// -------  -----
    /// 1        5s
    /// 2        10s
    /// 3        20s
    /// ...
    /// 7+       300s (cap)
    /// ```
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        // powi overflows to infinity long before attempt counts get large
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }
}

/// Tracks consecutive failures of one engine.
///
/// Each [`next_delay()`](Self::next_delay) returns a delay that is greater
/// than or equal to the previous one (strictly greater until the cap is
/// reached when `backoff_factor > 1`). [`reset()`](Self::reset) after a
/// fully successful cycle restarts the schedule at the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    consecutive_failures: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.config.delay_for_attempt(self.consecutive_failures)
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each handler call consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 50 calls/sec with burst of 10.
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 50,
        }
    }
}

/// Token bucket rate limiter.
///
/// Keeps many replications that reconnect at once from flooding the
/// master with handler calls.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_huge_attempt_does_not_overflow() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(5_000), config.max_delay);
        assert_eq!(config.delay_for_attempt(usize::MAX), config.max_delay);
    }

    #[test]
    fn test_backoff_non_decreasing_then_reset() {
        let mut backoff = Backoff::new(RetryConfig::testing());

        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "backoff regressed: {:?}", delays);
        }
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(100));
        assert_eq!(backoff.consecutive_failures(), 8);

        backoff.reset();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_never_gives_up() {
        let mut backoff = Backoff::new(RetryConfig::testing());
        for _ in 0..10_000 {
            backoff.next_delay();
        }
        assert_eq!(backoff.consecutive_failures(), 10_000);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_refills() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 1,
            refill_rate: 1000, // 1ms per token
        });

        limiter.acquire().await;

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "should refill quickly");
    }

    #[test]
    fn test_rate_limiter_zero_config_clamps() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 0);
    }
}
