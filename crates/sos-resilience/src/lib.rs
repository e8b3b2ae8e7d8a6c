#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-resilience** – Circuit breakers and token-bucket rate limiting.
//!
//! Both primitives expose synchronous, deterministic decisions: callers get
//! an immediate allow/deny and own their retry policy. Neither primitive
//! sleeps, retries, or performs I/O.

use std::time::Duration;

pub mod breaker;
pub mod limiter;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use limiter::{BucketConfig, RateLimiter};

/// Denials produced by the resilience primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// The named breaker is open; fail fast.
    #[error("circuit open: {0}")]
    CircuitOpen(String),
    /// The bucket for this (subject, action) is empty.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time until one token refills.
        retry_after: Duration,
    },
}

impl From<ResilienceError> for sos_types::SosError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen(name) => sos_types::SosError::CircuitOpen(name),
            ResilienceError::RateLimited { retry_after } => sos_types::SosError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            },
        }
    }
}
