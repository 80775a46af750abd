//! Rate limiting for preventing service overload
//!
//! Combines a burst token bucket with two sliding windows (one minute, one
//! hour). Tokens absorb short spikes; the windows enforce the sustained
//! per-minute and per-hour ceilings. A request is admissible when a whole
//! token is available or both windows are under their ceilings.
//!
//! Refill is lazy: tokens accrue at `max_calls_per_minute / 60` per second and
//! are topped up on every check, there is no background timer.

use super::error::ResilienceError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Rate limiter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Ceiling on requests in any trailing 60 seconds
    pub max_calls_per_minute: u32,
    /// Ceiling on requests in any trailing hour
    pub max_calls_per_hour: u32,
    /// Token bucket capacity
    pub burst_size: u32,
    /// Suggested pause after a limit is hit (informational)
    pub cooldown_seconds: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_calls_per_minute: 30,
            max_calls_per_hour: 1000,
            burst_size: 5,
            cooldown_seconds: 60,
        }
    }
}

impl RateLimiterConfig {
    fn refill_per_second(&self) -> f64 {
        self.max_calls_per_minute as f64 / 60.0
    }
}

#[derive(Debug)]
struct LimiterState {
    minute_window: VecDeque<Instant>,
    hour_window: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
}

impl LimiterState {
    fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            minute_window: VecDeque::new(),
            hour_window: VecDeque::new(),
            tokens: config.burst_size as f64,
            last_refill: now,
        }
    }

    /// Prune stale window entries and top up tokens
    fn refresh(&mut self, config: &RateLimiterConfig, now: Instant) {
        prune(&mut self.minute_window, now, MINUTE);
        prune(&mut self.hour_window, now, HOUR);

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * config.refill_per_second()).min(config.burst_size as f64);
        self.last_refill = now;
    }

    fn permits(&self, config: &RateLimiterConfig) -> bool {
        self.tokens >= 1.0
            || (self.minute_window.len() < config.max_calls_per_minute as usize
                && self.hour_window.len() < config.max_calls_per_hour as usize)
    }

    fn record(&mut self, now: Instant) {
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.minute_window.push_back(now);
        self.hour_window.push_back(now);
    }

    /// Time until a request becomes admissible; zero if it already is
    fn wait_time(&self, config: &RateLimiterConfig, now: Instant) -> Duration {
        if self.permits(config) {
            return Duration::ZERO;
        }

        let rate = config.refill_per_second();
        let token_wait = (rate > 0.0)
            .then(|| Duration::from_secs_f64(((1.0 - self.tokens) / rate).max(0.0)));

        let window_wait = [
            window_wait(&self.minute_window, config.max_calls_per_minute, MINUTE, now),
            window_wait(&self.hour_window, config.max_calls_per_hour, HOUR, now),
        ]
        .into_iter()
        .flatten()
        .max();

        match (token_wait, window_wait) {
            (Some(t), Some(w)) => t.min(w),
            (Some(t), None) => t,
            (None, Some(w)) => w,
            // Both ceilings are zero and nothing refills
            (None, None) => HOUR,
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, horizon: Duration) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Time until `window` drops below `ceiling`, or `None` if it already is
fn window_wait(
    window: &VecDeque<Instant>,
    ceiling: u32,
    horizon: Duration,
    now: Instant,
) -> Option<Duration> {
    let ceiling = ceiling as usize;
    if window.len() < ceiling {
        return None;
    }
    // Once this entry expires the window is back under its ceiling
    let entry = window.get(window.len() - ceiling)?;
    Some((*entry + horizon).saturating_duration_since(now))
}

/// Snapshot of limiter state
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    /// Requests in the trailing minute
    pub minute_count: usize,
    /// Requests in the trailing hour
    pub hour_count: usize,
    /// Burst tokens currently available
    pub tokens: f64,
}

/// Dual-window rate limiter with burst tokens
///
/// Clones share state. Independent limiters never interact.
///
/// # Example
/// ```no_run
/// use taskguard_core_resilience::{RateLimiter, RateLimiterConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let limiter = RateLimiter::new(RateLimiterConfig::default());
///
///     // Wait for a slot, then run
///     let answer = limiter
///         .execute(|| async { Ok::<_, ResilienceError>(42) })
///         .await?;
///
///     // Or check without blocking
///     if limiter.can_make_request().await {
///         limiter.record_request().await;
///     }
///     # let _ = answer;
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: Arc<RateLimiterConfig>,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full token bucket
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = LimiterState::new(&config, Instant::now());
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a rate limiter with default quotas (30/min, 1000/h, burst 5)
    pub fn new_default() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Whether a request may be made right now
    pub async fn can_make_request(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refresh(&self.config, Instant::now());
        state.permits(&self.config)
    }

    /// Count a request against the windows and spend a token
    ///
    /// Unconditional: it records even if the limiter would have refused.
    pub async fn record_request(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refresh(&self.config, now);
        state.record(now);
    }

    /// Time until a request becomes admissible; zero if it already is
    pub async fn get_wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refresh(&self.config, now);
        state.wait_time(&self.config, now)
    }

    /// Sleep until a request is admissible, without recording one
    pub async fn wait_for_rate_limit(&self) {
        loop {
            let wait = self.get_wait_time().await;
            if wait.is_zero() {
                return;
            }
            debug!(?wait, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait for admission and record the request in one step
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.refresh(&self.config, now);
                if state.permits(&self.config) {
                    state.record(now);
                    return;
                }
                state.wait_time(&self.config, now)
            };
            debug!(?wait, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Execute an operation with rate limiting
    ///
    /// This will wait until the request is admissible before executing the operation.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire().await;
        op().await
    }

    /// Try to execute an operation without waiting
    ///
    /// Returns RateLimitExceeded if the request is not admissible.
    pub async fn try_execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        {
            let now = Instant::now();
            let mut state = self.state.lock().await;
            state.refresh(&self.config, now);
            if !state.permits(&self.config) {
                return Err(ResilienceError::RateLimitExceeded.into());
            }
            state.record(now);
        }
        op().await
    }

    /// Clear both windows and refill the bucket
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = LimiterState::new(&self.config, Instant::now());
    }

    /// Current window counts and tokens
    pub async fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock().await;
        state.refresh(&self.config, Instant::now());
        RateLimiterStats {
            minute_count: state.minute_window.len(),
            hour_count: state.hour_window.len(),
            tokens: state.tokens,
        }
    }
}
