//! Token-bucket rate limiting per (subject, action).
//!
//! Each bucket refills proportionally to elapsed time, capped at capacity.
//! Buckets are created lazily on first sight of a (subject, action) pair
//! and reaped once idle past a threshold.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::ResilienceError;

/// Bucket tuning shared by one limiter.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Maximum tokens a bucket can hold.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Buckets untouched this long are eligible for reaping.
    pub idle_timeout: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_rate: 1.0,
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(config: &BucketConfig) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &BucketConfig) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.capacity);
        self.last_refill = Instant::now();
    }

    fn try_consume(&mut self, config: &BucketConfig) -> Result<(), Duration> {
        self.refill(config);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / config.refill_rate))
        }
    }
}

/// Per-(subject, action) token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: BucketConfig,
    buckets: DashMap<(String, String), Bucket>,
}

impl RateLimiter {
    /// Limiter whose buckets share `config`.
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for (subject, action), or deny with a retry hint.
    pub fn check(&self, subject: &str, action: &str) -> Result<(), ResilienceError> {
        let key = (subject.to_owned(), action.to_owned());
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::full(&self.config));
        bucket.try_consume(&self.config).map_err(|retry_after| {
            debug!(subject, action, ?retry_after, "rate limit exceeded");
            ResilienceError::RateLimited { retry_after }
        })
    }

    /// Tokens currently available for (subject, action), after refill.
    pub fn available(&self, subject: &str, action: &str) -> f64 {
        let key = (subject.to_owned(), action.to_owned());
        match self.buckets.get_mut(&key) {
            Some(mut bucket) => {
                bucket.refill(&self.config);
                bucket.tokens
            }
            None => self.config.capacity,
        }
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets idle past the configured timeout; returns the count.
    pub fn reap_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < timeout);
        let reaped = before - self.buckets.len();
        if reaped > 0 {
            debug!(reaped, "reaped idle rate-limit buckets");
        }
        reaped
    }
}
