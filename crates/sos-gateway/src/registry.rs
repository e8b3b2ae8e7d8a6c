//! The failover router over the adapter roster.
//!
//! Routing is a fold: order adapters by layer, skip those whose breaker is
//! open, try each in turn, and accumulate the error trail. Rate limits are
//! absorbed inside each adapter by key rotation first; whatever error an
//! adapter ultimately returns charges its breaker once and falls through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sos_resilience::{BreakerConfig, BreakerRegistry, BreakerState};
use sos_types::{SosError, SosResult};

use crate::adapters::ModelAdapter;
use crate::{ChunkStream, GatewayConfig, ModelRequest, ModelResponse};

/// Which end of the layer ordering to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPreference {
    /// Layer 1 first: lowest latency, richest models.
    PrimaryFirst,
    /// Layers 2+ first: cost-conscious executors.
    CheapFirst,
}

/// Readiness snapshot of one adapter, for `/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatus {
    /// Adapter (and breaker) name.
    pub name: String,
    /// Concrete model identifier.
    pub model: String,
    /// Failover layer.
    pub layer: u8,
    /// Keys in the rotation ring.
    pub keys: usize,
    /// Breaker state: `closed`, `open`, or `half_open`.
    pub breaker: String,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    requests: AtomicU64,
    failovers: AtomicU64,
    exhaustions: AtomicU64,
}

/// The single generation interface the engine and workers depend on.
pub struct ModelRegistry {
    adapters: Vec<Arc<dyn ModelAdapter>>,
    breakers: BreakerRegistry,
    counters: RegistryCounters,
}

impl ModelRegistry {
    /// Build a registry over `adapters`, sorted by layer ascending.
    ///
    /// Sort stability preserves the configured order within a layer.
    pub fn new(mut adapters: Vec<Arc<dyn ModelAdapter>>, breaker_config: BreakerConfig) -> Self {
        adapters.sort_by_key(|a| a.layer());
        info!(
            adapters = adapters.len(),
            roster = ?adapters.iter().map(|a| a.name().to_owned()).collect::<Vec<_>>(),
            "model registry initialized"
        );
        Self {
            adapters,
            breakers: BreakerRegistry::new(breaker_config),
            counters: RegistryCounters::default(),
        }
    }

    /// Build from environment configuration.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.build_adapters()?, BreakerConfig::default()))
    }

    /// Generate preferring primary layers.
    pub async fn generate(&self, request: &ModelRequest) -> SosResult<ModelResponse> {
        self.generate_with(request, LayerPreference::PrimaryFirst)
            .await
    }

    /// Generate preferring cheap layers (2+), falling back to layer 1.
    pub async fn generate_cheap(&self, request: &ModelRequest) -> SosResult<ModelResponse> {
        self.generate_with(request, LayerPreference::CheapFirst)
            .await
    }

    /// Generate with an explicit layer preference.
    pub async fn generate_with(
        &self,
        request: &ModelRequest,
        preference: LayerPreference,
    ) -> SosResult<ModelResponse> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let mut trail: Vec<String> = Vec::new();
        for (idx, adapter) in self.ordered(preference).into_iter().enumerate() {
            let breaker = self.breakers.get(adapter.name());
            if breaker.check().is_err() {
                debug!(adapter = adapter.name(), "skipping open breaker");
                trail.push(format!("{}: circuit open", adapter.name()));
                continue;
            }
            match adapter.generate(request).await {
                Ok(response) => {
                    breaker.record_success();
                    if idx > 0 {
                        self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(
                        adapter = adapter.name(),
                        duration_ms = response.duration_ms,
                        "generation succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    warn!(adapter = adapter.name(), error = %err, "adapter failed, falling through");
                    breaker.record_failure();
                    trail.push(err.to_string());
                }
            }
        }
        self.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        Err(SosError::AllProvidersFailed {
            trail: trail.join("; "),
        })
    }

    /// Open a stream from the first adapter that accepts the request.
    ///
    /// Fallback happens only before a stream is obtained; once chunks flow,
    /// a mid-stream failure terminates with an in-band error marker and is
    /// never replayed elsewhere.
    pub async fn generate_stream(&self, request: &ModelRequest) -> SosResult<ChunkStream> {
        let mut trail: Vec<String> = Vec::new();
        for adapter in self.ordered(LayerPreference::PrimaryFirst) {
            let breaker = self.breakers.get(adapter.name());
            if breaker.check().is_err() {
                trail.push(format!("{}: circuit open", adapter.name()));
                continue;
            }
            match adapter.generate_stream(request).await {
                Ok(stream) => {
                    breaker.record_success();
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(adapter = adapter.name(), error = %err, "stream open failed");
                    breaker.record_failure();
                    trail.push(err.to_string());
                }
            }
        }
        Err(SosError::AllProvidersFailed {
            trail: trail.join("; "),
        })
    }

    /// Readiness of every adapter, for the `/models` endpoint.
    pub fn statuses(&self) -> Vec<AdapterStatus> {
        self.adapters
            .iter()
            .map(|adapter| {
                let state = match self.breakers.get(adapter.name()).state() {
                    BreakerState::Closed => "closed",
                    BreakerState::Open => "open",
                    BreakerState::HalfOpen => "half_open",
                };
                AdapterStatus {
                    name: adapter.name().to_owned(),
                    model: adapter.model().to_owned(),
                    layer: adapter.layer(),
                    keys: adapter.key_count(),
                    breaker: state.to_owned(),
                }
            })
            .collect()
    }

    /// Whether any adapter is currently willing to take a call.
    pub fn any_ready(&self) -> bool {
        self.adapters
            .iter()
            .any(|a| self.breakers.get(a.name()).state() != BreakerState::Open)
    }

    /// (requests, failovers, exhaustions) counters for metrics export.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.counters.requests.load(Ordering::Relaxed),
            self.counters.failovers.load(Ordering::Relaxed),
            self.counters.exhaustions.load(Ordering::Relaxed),
        )
    }

    /// Direct access to an adapter's breaker, mainly for tests and health.
    pub fn breaker_state(&self, adapter_name: &str) -> BreakerState {
        self.breakers.get(adapter_name).state()
    }

    fn ordered(&self, preference: LayerPreference) -> Vec<Arc<dyn ModelAdapter>> {
        match preference {
            LayerPreference::PrimaryFirst => self.adapters.clone(),
            LayerPreference::CheapFirst => {
                let (cheap, rich): (Vec<_>, Vec<_>) = self
                    .adapters
                    .iter()
                    .cloned()
                    .partition(|a| a.layer() >= 2);
                cheap.into_iter().chain(rich).collect()
            }
        }
    }
}
