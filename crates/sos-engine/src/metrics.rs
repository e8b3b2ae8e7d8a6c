//! Prometheus metrics for the engine surface.

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Engine metric handles registered against one process-local registry.
pub struct EngineMetrics {
    registry: Registry,
    /// Requests by route and status class.
    pub http_requests: IntCounterVec,
    /// Request latency by route.
    pub http_latency: HistogramVec,
    /// Requests rejected by the per-endpoint in-flight budget or limiter.
    pub throttled: IntCounter,
    /// Tasks spawned by the chat heuristic.
    pub tasks_created: IntCounter,
    /// Results accepted through `/tasks/{id}/submit`.
    pub submissions: IntCounter,
    /// Requests currently in flight across all routes.
    pub in_flight: IntGauge,
    /// Most recent omega value.
    pub omega_last: Gauge,
}

impl EngineMetrics {
    /// Create and register every metric.
    pub fn new() -> Self {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("sos_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )
        .expect("static metric definition");
        let http_latency = HistogramVec::new(
            HistogramOpts::new("sos_http_latency_seconds", "HTTP latency by route"),
            &["route"],
        )
        .expect("static metric definition");
        let throttled = IntCounter::new(
            "sos_http_throttled_total",
            "Requests rejected by rate limits or in-flight budgets",
        )
        .expect("static metric definition");
        let tasks_created =
            IntCounter::new("sos_tasks_created_total", "Tasks spawned by the chat heuristic")
                .expect("static metric definition");
        let submissions =
            IntCounter::new("sos_task_submissions_total", "Accepted task submissions")
                .expect("static metric definition");
        let in_flight = IntGauge::new("sos_http_in_flight", "Requests currently in flight")
            .expect("static metric definition");
        let omega_last = Gauge::new("sos_chat_omega", "Most recent chat coherence value")
            .expect("static metric definition");

        for collector in [
            Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_latency.clone()),
            Box::new(throttled.clone()),
            Box::new(tasks_created.clone()),
            Box::new(submissions.clone()),
            Box::new(in_flight.clone()),
            Box::new(omega_last.clone()),
        ] {
            registry.register(collector).expect("unique metric names");
        }

        Self {
            registry,
            http_requests,
            http_latency,
            throttled,
            tasks_created,
            submissions,
            in_flight,
            omega_last,
        }
    }

    /// Record a fresh omega observation.
    pub fn observe_omega(&self, omega: f64) {
        self.omega_last.set(omega);
    }

    /// Render the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
