//! Named circuit breakers.
//!
//! A breaker is a closed/open/half-open state machine. In *closed*, each
//! failure increments a counter; at the threshold the breaker opens and
//! records the instant. In *open*, calls fail fast until `open_duration`
//! elapses, then the breaker moves to *half-open* and admits one probe.
//! A successful probe closes the breaker with zero failures; a failed
//! probe reopens it with a fresh timestamp.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ResilienceError;

/// Per-breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Healthy; calls flow.
    Closed,
    /// Tripped; calls fail fast.
    Open,
    /// Cooling down; the next call probes.
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// A named circuit breaker protecting one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker named `name`.
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gate a call. `Ok` means proceed (possibly as a half-open probe);
    /// `Err(CircuitOpen)` means fail fast.
    pub fn check(&self) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock();
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen => Ok(()),
            Inner::Open { since } => {
                if since.elapsed() >= self.config.open_duration {
                    debug!(breaker = %self.name, "open duration elapsed, probing half-open");
                    *inner = Inner::HalfOpen;
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful call; closes the breaker and zeroes the counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if !matches!(&*inner, Inner::Closed { failures: 0 }) {
            debug!(breaker = %self.name, "closing after success");
        }
        *inner = Inner::Closed { failures: 0 };
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = *failures,
                        "failure threshold reached, opening"
                    );
                    *inner = Inner::Open { since: Instant::now() };
                }
            }
            Inner::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening");
                *inner = Inner::Open { since: Instant::now() };
            }
            Inner::Open { .. } => {
                // Late failure reports while open refresh nothing.
            }
        }
    }

    /// Current consecutive-failure count (zero unless closed).
    pub fn failure_count(&self) -> u32 {
        match &*self.inner.lock() {
            Inner::Closed { failures } => *failures,
            _ => 0,
        }
    }

    /// Observable state, resolving an elapsed open window to half-open.
    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::HalfOpen => BreakerState::HalfOpen,
            Inner::Open { since } => {
                if since.elapsed() >= self.config.open_duration {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }
}

/// Registry of named breakers with shared default tuning.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    /// Registry whose lazily-created breakers use `default_config`.
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Fetch or lazily create the breaker named `name`.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    /// Names of breakers currently not closed, for health reporting.
    pub fn tripped(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|entry| entry.value().state() != BreakerState::Closed)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_millis(open_ms),
            },
        )
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = fast_breaker(3, 60_000);
        for _ in 0..2 {
            breaker.record_failure();
            assert!(breaker.check().is_ok());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(
            breaker.check(),
            Err(ResilienceError::CircuitOpen("test".into()))
        );
    }

    #[tokio::test]
    async fn probes_after_open_duration_and_success_resets() {
        let breaker = fast_breaker(1, 20);
        breaker.record_failure();
        assert!(breaker.check().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // First check after cooldown is the probe.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        // Idempotent closure: the counter restarts from zero.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = fast_breaker(1, 20);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn registry_shares_instances() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
        });
        let a = registry.get("anthropic");
        let b = registry.get("anthropic");
        a.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(registry.tripped(), vec!["anthropic".to_string()]);
    }
}
