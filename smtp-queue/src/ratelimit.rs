use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

/// Grants (possibly after waiting) permission to send a single message.
///
/// Implementations must never hold an internal lock across the wait: the
/// bucket/window state is only touched long enough to decide whether a
/// permit is available and, if not, how long to sleep before trying again.
#[async_trait]
pub trait RateLimiter: 'static + Send + Sync {
    async fn acquire(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct TokenBucketConfig {
    pub max_tokens: f64,
    pub tokens_per_second: f64,
}

pub struct TokenBucketRateLimiter {
    config: TokenBucketConfig,
    state: Mutex<TokenBucketState>,
}

struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketRateLimiter {
    pub fn new(config: TokenBucketConfig) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter {
            config,
            state: Mutex::new(TokenBucketState {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills the bucket and either takes a token or reports how long to
    /// wait before the next attempt. Returns `None` when a token was taken.
    fn try_acquire(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let to_add = elapsed * self.config.tokens_per_second;
        if to_add > 0.0 {
            state.tokens = (state.tokens + to_add).min(self.config.max_tokens);
            state.last_refill = now;
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let needed = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(needed / self.config.tokens_per_second))
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketRateLimiter {
    async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                None => return,
                Some(wait) => {
                    tracing::debug!(?wait, "rate limited, waiting for a token");
                    smol::Timer::after(wait).await;
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedWindowConfig {
    pub window: Duration,
    pub requests_per_window: u32,
}

pub struct FixedWindowRateLimiter {
    config: FixedWindowConfig,
    state: Mutex<FixedWindowState>,
}

struct FixedWindowState {
    window_start: Instant,
    request_count: u32,
}

impl FixedWindowRateLimiter {
    pub fn new(config: FixedWindowConfig) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter {
            config,
            state: Mutex::new(FixedWindowState {
                window_start: Instant::now(),
                request_count: 0,
            }),
        }
    }

    /// Returns `Some(wait)` if the current window is exhausted and the
    /// caller must sleep before a new window starts, `None` if a slot in
    /// the current window was claimed.
    fn try_acquire(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.request_count = 0;
        }
        if state.request_count >= self.config.requests_per_window {
            let wait = (state.window_start + self.config.window).saturating_duration_since(now);
            if wait > Duration::ZERO {
                return Some(wait);
            }
            state.window_start = Instant::now();
            state.request_count = 0;
        }
        state.request_count += 1;
        None
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                None => return,
                Some(wait) => {
                    tracing::debug!(?wait, "rate limited, waiting for window to reset");
                    smol::Timer::after(wait).await;
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LeakyBucketConfig {
    pub bucket_capacity: f64,
    pub leak_rate: f64,
}

pub struct LeakyBucketRateLimiter {
    config: LeakyBucketConfig,
    state: Mutex<LeakyBucketState>,
}

struct LeakyBucketState {
    current_volume: f64,
    last_leak: Instant,
}

impl LeakyBucketRateLimiter {
    pub fn new(config: LeakyBucketConfig) -> LeakyBucketRateLimiter {
        LeakyBucketRateLimiter {
            config,
            state: Mutex::new(LeakyBucketState {
                current_volume: 0.0,
                last_leak: Instant::now(),
            }),
        }
    }

    fn try_acquire(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_leak).as_secs_f64();
        let leaked = elapsed * self.config.leak_rate;
        if leaked > 0.0 {
            state.current_volume = (state.current_volume - leaked).max(0.0);
            state.last_leak = now;
        }
        if state.current_volume < self.config.bucket_capacity {
            state.current_volume += 1.0;
            None
        } else {
            let overflow = state.current_volume - self.config.bucket_capacity + 1.0;
            Some(Duration::from_secs_f64(overflow / self.config.leak_rate))
        }
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketRateLimiter {
    async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                None => return,
                Some(wait) => {
                    tracing::debug!(?wait, "rate limited, waiting for bucket to drain");
                    smol::Timer::after(wait).await;
                }
            }
        }
    }
}

/// Runs an ordered chain of sub-limiters: a permit is only granted once
/// every sub-limiter in the chain has granted one.
pub struct CompositeRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl CompositeRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> CompositeRateLimiter {
        CompositeRateLimiter { limiters }
    }
}

#[async_trait]
impl RateLimiter for CompositeRateLimiter {
    async fn acquire(&self) {
        for limiter in &self.limiters {
            limiter.acquire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_grants_up_to_capacity_immediately() {
        let limiter = TokenBucketRateLimiter::new(TokenBucketConfig {
            max_tokens: 3.0,
            tokens_per_second: 1.0,
        });
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn fixed_window_resets_after_window_elapses() {
        let limiter = FixedWindowRateLimiter::new(FixedWindowConfig {
            window: Duration::from_millis(10),
            requests_per_window: 1,
        });
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire().is_none());
    }

    #[test]
    fn leaky_bucket_rejects_once_full() {
        let limiter = LeakyBucketRateLimiter::new(LeakyBucketConfig {
            bucket_capacity: 2.0,
            leak_rate: 1.0,
        });
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_none());
        assert!(limiter.try_acquire().is_some());
    }
}
