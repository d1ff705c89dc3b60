//! Minimum inter-request delay for an API endpoint
//!
//! AniDB allows one request every two seconds in the short term and one every
//! four seconds once a client has been busy for a while. The limiter switches
//! to the long delay after `short_period` of continuous use and back to the
//! short delay after `reset_period` without requests.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Delay settings for a [`RateLimiter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Delay while the client has only been busy briefly
    pub short_delay: Duration,
    /// Delay once the client has been busy for `short_period`
    pub long_delay: Duration,
    /// Continuous activity after which `long_delay` applies
    pub short_period: Duration,
    /// Idle time after which the activity window restarts
    pub reset_period: Duration,
}

impl RateLimitConfig {
    /// Limits for the UDP API
    pub const fn udp() -> Self {
        Self {
            short_delay: Duration::from_secs(2),
            long_delay: Duration::from_secs(4),
            short_period: Duration::from_secs(60 * 60),
            reset_period: Duration::from_secs(30 * 60),
        }
    }

    /// Limits for the HTTP API
    pub const fn http() -> Self {
        Self {
            short_delay: Duration::from_secs(2),
            long_delay: Duration::from_secs(4),
            short_period: Duration::from_secs(60 * 60),
            reset_period: Duration::from_secs(30 * 60),
        }
    }

    /// The same delay regardless of activity
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            short_delay: delay,
            long_delay: delay,
            short_period: Duration::MAX,
            reset_period: Duration::MAX,
        }
    }
}

#[derive(Debug, Default)]
struct RateState {
    last_request: Option<Instant>,
    active_since: Option<Instant>,
}

impl RateState {
    fn delay(&mut self, config: &RateLimitConfig, now: Instant, force_short: bool) -> Duration {
        if let Some(last) = self.last_request {
            if now.saturating_duration_since(last) > config.reset_period {
                self.active_since = None;
            }
        }

        if force_short {
            return config.short_delay;
        }

        match self.active_since {
            Some(since) if now.saturating_duration_since(since) > config.short_period => {
                config.long_delay
            }
            _ => config.short_delay,
        }
    }
}

/// Enforces a minimum delay between consecutive requests to one endpoint
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(RateState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait for our turn and hold it until the returned permit is dropped
    ///
    /// Only one permit exists at a time, so holding it across a request keeps
    /// that request the only one in flight. The next request's delay is
    /// measured from the moment the permit is released. Dropping the future
    /// while it waits gives up the turn without recording a request.
    pub async fn acquire(&self, force_short: bool) -> RatePermit<'_> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let delay = state.delay(&self.config, now, force_short);

        if let Some(last) = state.last_request {
            let ready_at = last + delay;
            if ready_at > now {
                trace!(
                    limiter = self.name,
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "Waiting for rate limit"
                );
                sleep_until(ready_at).await;
            }
        }

        RatePermit {
            state,
            record: true,
        }
    }

    /// Wait for our turn without holding it across the request
    ///
    /// Consecutive callers still start at least one delay apart.
    pub async fn wait_turn(&self, force_short: bool) {
        drop(self.acquire(force_short).await);
    }
}

/// Exclusive right to send the next request
#[derive(Debug)]
pub struct RatePermit<'a> {
    state: MutexGuard<'a, RateState>,
    record: bool,
}

impl RatePermit<'_> {
    /// Give the turn back without having sent anything
    ///
    /// The next caller's delay is measured from the last request that did go
    /// out.
    pub fn abandon(mut self) {
        self.record = false;
    }
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        if !self.record {
            return;
        }
        let now = Instant::now();
        self.state.last_request = Some(now);
        if self.state.active_since.is_none() {
            self.state.active_since = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SECS: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new("test", RateLimitConfig::udp());
        let start = Instant::now();
        limiter.wait_turn(false).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_requests_are_spaced() {
        let limiter = RateLimiter::new("test", RateLimitConfig::udp());
        let mut starts = Vec::new();
        for _ in 0..3 {
            let _permit = limiter.acquire(false).await;
            starts.push(Instant::now());
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= TWO_SECS);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_delay_after_sustained_activity() {
        let config = RateLimitConfig {
            short_delay: Duration::from_secs(1),
            long_delay: Duration::from_secs(5),
            short_period: Duration::from_secs(10),
            reset_period: Duration::from_secs(60),
        };
        let limiter = RateLimiter::new("test", config);

        // Twelve requests one second apart push past the short period
        for _ in 0..12 {
            limiter.wait_turn(false).await;
        }

        let before = Instant::now();
        limiter.wait_turn(false).await;
        assert!(before.elapsed() >= Duration::from_secs(5));

        // Pings keep the short delay
        let before = Instant::now();
        limiter.wait_turn(true).await;
        assert!(before.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_resets_to_short_delay() {
        let config = RateLimitConfig {
            short_delay: Duration::from_secs(1),
            long_delay: Duration::from_secs(5),
            short_period: Duration::from_secs(3),
            reset_period: Duration::from_secs(30),
        };
        let limiter = RateLimiter::new("test", config);
        for _ in 0..6 {
            limiter.wait_turn(false).await;
        }

        tokio::time::sleep(Duration::from_secs(31)).await;
        limiter.wait_turn(false).await;

        let before = Instant::now();
        limiter.wait_turn(false).await;
        assert_eq!(before.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_does_not_consume_turn() {
        let limiter = RateLimiter::new("test", RateLimitConfig::fixed(TWO_SECS));
        limiter.wait_turn(false).await;
        let first = Instant::now();

        let waiting = tokio::time::timeout(Duration::from_millis(500), limiter.wait_turn(false));
        assert!(waiting.await.is_err());

        limiter.wait_turn(false).await;
        assert_eq!(Instant::now() - first, TWO_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_permit_does_not_delay_next_request() {
        let limiter = RateLimiter::new("test", RateLimitConfig::fixed(TWO_SECS));
        limiter.wait_turn(false).await;
        let first = Instant::now();

        let permit = limiter.acquire(false).await;
        assert_eq!(Instant::now() - first, TWO_SECS);
        permit.abandon();

        let before = Instant::now();
        limiter.wait_turn(false).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
