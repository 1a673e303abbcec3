//! Multi-category rate limiter shared by all upstream API callers.
//!
//! Each category carries its own budget and strategy. `acquire` suspends the
//! caller until a unit of budget is available; state lives under a short
//! critical section and is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Category used by the post-search client.
pub const CAT_SEARCH: &str = "search";
/// Category used for per-bar summary calls (fast model).
pub const CAT_SUMMARY_FAST: &str = "summary_fast";
/// Category used for digest synthesis (reasoning model).
pub const CAT_SUMMARY_REASONING: &str = "summary_reasoning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SlidingWindow,
    FixedWindow,
    TokenBucket,
}

/// Budget for a single category.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_seconds: u64,
    pub strategy: Strategy,
}

impl RateLimitConfig {
    pub fn sliding(requests_per_window: u32, window_seconds: u64) -> Self {
        Self {
            requests_per_window,
            window_seconds,
            strategy: Strategy::SlidingWindow,
        }
    }

    pub fn fixed(requests_per_window: u32, window_seconds: u64) -> Self {
        Self {
            requests_per_window,
            window_seconds,
            strategy: Strategy::FixedWindow,
        }
    }

    pub fn token_bucket(requests_per_window: u32, window_seconds: u64) -> Self {
        Self {
            requests_per_window,
            window_seconds,
            strategy: Strategy::TokenBucket,
        }
    }
}

enum CategoryState {
    /// Instants of the most recent grants, oldest first.
    Sliding { grants: VecDeque<Instant> },
    /// Epoch-aligned window start (unix seconds) and grants charged in it.
    Fixed { window_start: u64, count: u32 },
    /// Continuously refilled tokens, capped at the configured limit.
    Bucket { tokens: f64, last_refill: Instant },
}

struct Category {
    config: RateLimitConfig,
    state: CategoryState,
}

impl Category {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        let state = match config.strategy {
            Strategy::SlidingWindow => CategoryState::Sliding {
                grants: VecDeque::new(),
            },
            Strategy::FixedWindow => CategoryState::Fixed {
                window_start: 0,
                count: 0,
            },
            Strategy::TokenBucket => CategoryState::Bucket {
                tokens: config.requests_per_window as f64,
                last_refill: now,
            },
        };
        Self { config, state }
    }

    /// Try to charge one unit at `now`. Returns how long the caller must
    /// wait before retrying, or `None` when the unit was charged.
    fn try_charge(&mut self, now: Instant, unix_now: f64) -> Option<Duration> {
        let window = Duration::from_secs(self.config.window_seconds);
        let limit = self.config.requests_per_window;

        match &mut self.state {
            CategoryState::Sliding { grants } => {
                while let Some(front) = grants.front() {
                    if now.duration_since(*front) >= window {
                        grants.pop_front();
                    } else {
                        break;
                    }
                }
                if (grants.len() as u32) < limit {
                    grants.push_back(now);
                    None
                } else {
                    let oldest = *grants.front().expect("non-empty at limit");
                    Some((oldest + window).saturating_duration_since(now))
                }
            }
            CategoryState::Fixed {
                window_start,
                count,
            } => {
                let current = (unix_now as u64) / self.config.window_seconds
                    * self.config.window_seconds;
                if *window_start != current {
                    *window_start = current;
                    *count = 0;
                }
                if *count < limit {
                    *count += 1;
                    None
                } else {
                    let next = (*window_start + self.config.window_seconds) as f64;
                    Some(Duration::from_secs_f64((next - unix_now).max(0.0)))
                }
            }
            CategoryState::Bucket {
                tokens,
                last_refill,
            } => {
                let rate = limit as f64 / self.config.window_seconds as f64;
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(limit as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / rate))
                }
            }
        }
    }

    fn remaining(&self, now: Instant, unix_now: f64) -> u32 {
        let window = Duration::from_secs(self.config.window_seconds);
        let limit = self.config.requests_per_window;

        match &self.state {
            CategoryState::Sliding { grants } => {
                let recent = grants
                    .iter()
                    .filter(|g| now.duration_since(**g) < window)
                    .count() as u32;
                limit.saturating_sub(recent)
            }
            CategoryState::Fixed {
                window_start,
                count,
            } => {
                let current = (unix_now as u64) / self.config.window_seconds
                    * self.config.window_seconds;
                if *window_start == current {
                    limit.saturating_sub(*count)
                } else {
                    limit
                }
            }
            CategoryState::Bucket { tokens, .. } => (tokens.floor().max(0.0) as u32).min(limit),
        }
    }
}

/// Shared gatekeeper routing every upstream request through a named category.
pub struct RateLimiter {
    categories: Mutex<HashMap<String, Category>>,
    /// Anchor pair mapping the monotonic clock onto unix time; fixed
    /// windows are epoch-aligned.
    epoch: Instant,
    epoch_unix: f64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        let epoch_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            categories: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            epoch_unix,
        }
    }

    /// Limiter pre-configured with the standard upstream categories.
    pub fn standard() -> Self {
        let limiter = Self::new();
        limiter.configure(CAT_SEARCH, RateLimitConfig::sliding(300, 900));
        limiter.configure(CAT_SUMMARY_FAST, RateLimitConfig::sliding(60, 60));
        limiter.configure(CAT_SUMMARY_REASONING, RateLimitConfig::sliding(30, 60));
        limiter
    }

    fn unix_now(&self) -> f64 {
        self.epoch_unix + self.epoch.elapsed().as_secs_f64()
    }

    /// Install or replace a category's budget. Idempotent.
    pub fn configure(&self, category: &str, config: RateLimitConfig) {
        let mut cats = self.categories.lock();
        cats.insert(category.to_string(), Category::new(config, Instant::now()));
        debug!(
            category,
            limit = config.requests_per_window,
            window_s = config.window_seconds,
            "configured rate limit"
        );
    }

    /// Wait until one unit of `category`'s budget is available, then charge
    /// it. Unknown categories fail open. Charged units are never refunded,
    /// even when the guarded call later fails.
    pub async fn acquire(&self, category: &str) {
        loop {
            let wait = {
                let mut cats = self.categories.lock();
                match cats.get_mut(category) {
                    Some(cat) => cat.try_charge(Instant::now(), self.unix_now()),
                    None => {
                        warn!(category, "no rate limit configured, allowing request");
                        return;
                    }
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!(category, wait_ms = delay.as_millis() as u64, "rate limited");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best-effort headroom for a category, never exceeding the configured
    /// limit. Unconfigured categories have no budget to report and return
    /// `None`.
    pub fn remaining(&self, category: &str) -> Option<u32> {
        let cats = self.categories.lock();
        cats.get(category)
            .map(|cat| cat.remaining(Instant::now(), self.unix_now()))
    }
}
