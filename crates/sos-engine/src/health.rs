//! The `/health` aggregation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Engine;

/// Timeout for external health probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Overall service condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Ok,
    /// A non-essential dependency is down.
    Degraded,
    /// The engine cannot do useful work.
    Unhealthy,
}

/// One dependency's probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    /// Probe succeeded.
    Ok,
    /// Probe failed.
    Failed,
    /// Dependency not configured in this deployment.
    NotConfigured,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Aggregate condition.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// Service name.
    pub service: String,
    /// Seconds since engine start.
    pub uptime_seconds: u64,
    /// Per-dependency results.
    pub checks: HealthChecks,
}

/// The fixed dependency roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Mirror memory service.
    pub memory: CheckResult,
    /// Economy service.
    pub economy: CheckResult,
    /// Tool registry (in-process in v1).
    pub tools: CheckResult,
    /// The task store's backing directory.
    pub database: CheckResult,
}

/// Run every check and aggregate.
pub async fn health_snapshot(engine: &Engine) -> HealthResponse {
    let services = engine.services();

    let memory = match &services.memory {
        Some(memory) => {
            if memory.healthy().await {
                CheckResult::Ok
            } else {
                CheckResult::Failed
            }
        }
        None => CheckResult::NotConfigured,
    };

    let economy = match &services.config.economy_url {
        Some(url) => probe_http(url).await,
        None => CheckResult::NotConfigured,
    };

    // Tools are in-process in v1; the check exists for the contract.
    let tools = CheckResult::Ok;

    let database = match services.store.list(None).await {
        Ok(_) => CheckResult::Ok,
        Err(_) => CheckResult::Failed,
    };

    let status = if database == CheckResult::Failed {
        HealthStatus::Unhealthy
    } else if memory == CheckResult::Failed
        || economy == CheckResult::Failed
        || !services.models.any_ready()
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };

    HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "sos-engine".to_string(),
        uptime_seconds: engine.uptime_secs(),
        checks: HealthChecks {
            memory,
            economy,
            tools,
            database,
        },
    }
}

async fn probe_http(base_url: &str) -> CheckResult {
    let Ok(client) = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() else {
        return CheckResult::Failed;
    };
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => CheckResult::Ok,
        _ => CheckResult::Failed,
    }
}
