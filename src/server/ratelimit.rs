//! Per-connection command rate limiting
//!
//! Each authenticated socket owns one [`CommandRateLimiter`], a token bucket
//! refilled at `rate` tokens per second up to `burst`. A command consumes one
//! token; an empty bucket rejects the command before validation.

use std::time::{Duration, Instant};

pub use crate::config::{DEFAULT_COMMAND_BURST, DEFAULT_COMMAND_RATE};

/// Token bucket state for a single connection
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    /// Tokens per second
    rate: f64,
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        TokenBucket {
            tokens: burst,
            last_refill: now,
            rate,
            max_tokens: burst,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        // A non-positive rate never refills.
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct CommandRateLimiter {
    bucket: TokenBucket,
}

impl CommandRateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: TokenBucket::new(rate, burst, Instant::now()),
        }
    }

    /// Consume one token. `false` means the command must be rejected.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub(crate) fn check_at(&mut self, now: Instant) -> bool {
        self.bucket.try_consume(now)
    }

    /// Wait until the next token, rounded up to whole seconds for display.
    pub fn retry_after_secs(&self) -> u64 {
        self.bucket.time_until_available().as_secs_f64().ceil() as u64
    }
}

impl Default for CommandRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_RATE, DEFAULT_COMMAND_BURST)
    }
}
