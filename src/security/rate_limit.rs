//! Rate limiting primitives
//!
//! This module implements the token bucket used by the admission controller
//! and its configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for `window_secs` and `cooldown_secs` (one year)
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Convert seconds to a Duration, saturating instead of panicking
fn saturating_secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum requests per time window (bucket capacity)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Time window duration in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Burst limit; a denied provider with more than twice this many
    /// requests in the last minute is blocked
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    /// How long an anomalous provider stays blocked, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_burst_limit() -> u32 {
    10
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            burst_limit: default_burst_limit(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new rate limiter configuration
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            enabled: true,
            max_requests,
            window_secs,
            burst_limit: max_requests / 10, // Default burst is 10% of max
            cooldown_secs: default_cooldown_secs(),
        }
    }

    /// Configuration that admits everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set burst limit
    pub fn with_burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    /// Set block cooldown
    pub fn with_cooldown_secs(mut self, cooldown_secs: u64) -> Self {
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.window_secs as f64
    }

    /// Cooldown as a Duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if self.max_requests == 0 {
                return Err("max_requests must be greater than 0".to_string());
            }
            if self.window_secs == 0 {
                return Err("window_secs must be greater than 0".to_string());
            }
            if self.window_secs > MAX_PERIOD_SECS {
                return Err(format!("window_secs cannot exceed {}", MAX_PERIOD_SECS));
            }
            if self.cooldown_secs == 0 {
                return Err("cooldown_secs must be greater than 0".to_string());
            }
            if self.cooldown_secs > MAX_PERIOD_SECS {
                return Err(format!("cooldown_secs cannot exceed {}", MAX_PERIOD_SECS));
            }
            if self.burst_limit > self.max_requests {
                return Err("burst_limit cannot exceed max_requests".to_string());
            }
        }
        Ok(())
    }
}

/// Token bucket for rate limiting
///
/// Tokens are fractional internally and refilled lazily from elapsed time;
/// `0 <= tokens <= capacity` always holds.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    /// Available tokens
    tokens: f64,
    /// Maximum tokens
    capacity: f64,
    /// Token refill rate per second
    refill_rate: f64,
    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full token bucket
    pub(crate) fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_refill: now,
        }
    }

    /// Tokens that would be available at `now`, without mutating
    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Refill tokens based on elapsed time
    pub(crate) fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
    }

    /// Try to consume a token
    pub(crate) fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens available at `now`
    pub(crate) fn available(&self, now: Instant) -> u32 {
        self.tokens_at(now).floor() as u32
    }

    /// Time for one token to accrue from empty
    pub(crate) fn time_per_token(&self) -> Duration {
        saturating_secs_f64(1.0 / self.refill_rate)
    }

    /// Time until the bucket is full again, as of the last refill
    pub(crate) fn time_to_full(&self) -> Duration {
        saturating_secs_f64((self.capacity - self.tokens).max(0.0) / self.refill_rate)
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}
