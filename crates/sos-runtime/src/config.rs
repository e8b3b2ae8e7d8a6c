//! The `SOS_*` environment surface.
//!
//! One load at startup produces an immutable [`SosConfig`] that is injected
//! everywhere; no module reads the environment after boot.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::Secret;
use tracing::warn;

/// Default engine bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:6060";

/// Default claim-loop period in seconds.
pub const DEFAULT_TASK_POLLING_INTERVAL: u64 = 60;

/// Default worker execution timeout in seconds.
pub const DEFAULT_WORKER_TIMEOUT: u64 = 300;

/// Default backpressure ceiling on the work-queue stream.
pub const DEFAULT_QUEUE_DEPTH_LIMIT: usize = 1000;

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| {
            v.trim()
                .parse()
                .map_err(|e| warn!("failed to parse {key}: {e}"))
                .ok()
        })
        .unwrap_or(default)
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Immutable runtime configuration, loaded once at boot.
#[derive(Debug, Clone)]
pub struct SosConfig {
    /// Root for task files, secrets, artifacts (`SOS_HOME`, default `~/.sos`).
    pub home: PathBuf,
    /// The daemon's own agent identity.
    pub agent_id: String,
    /// Enforce-vs-log mode for capability middleware.
    pub strict_capabilities: bool,
    /// Whether banner log lines keep their decorative glyphs.
    pub log_emojis: bool,
    /// Claim-loop period.
    pub task_polling_interval: Duration,
    /// Kill-switch: claim loop.
    pub auto_claim_enabled: bool,
    /// Kill-switch: worker execution.
    pub auto_execute_enabled: bool,
    /// Kill-switch: report loop.
    pub auto_report_enabled: bool,
    /// The work-queue stream name.
    pub worker_queue: String,
    /// Per-task execution timeout for workers.
    pub worker_timeout: Duration,
    /// Engine bind address.
    pub bind_addr: SocketAddr,
    /// Mirror memory service base URL, when deployed.
    pub memory_url: Option<String>,
    /// Economy service base URL, when deployed.
    pub economy_url: Option<String>,
    /// Queue substrate URL; absent means the in-memory bus.
    pub redis_url: Option<String>,
    /// Claim-loop backpressure ceiling on stream depth.
    pub queue_depth_limit: usize,
    /// 64-hex-char AES key for the secrets vault.
    pub secret_key: Option<Secret<String>>,
    /// 64-hex-char ed25519 seed for the capability issuer; generated fresh
    /// when absent (tokens then expire with the process, which short TTLs
    /// already assume).
    pub issuer_seed: Option<Secret<String>>,
}

impl SosConfig {
    /// Load from the environment.
    pub fn from_env() -> Result<Self> {
        let home = env::var("SOS_HOME")
            .map(|raw| expand_home(&raw))
            .unwrap_or_else(|_| expand_home("~/.sos"));
        let bind_addr: SocketAddr = env::var("SOS_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("SOS_BIND_ADDR is not a socket address")?;
        Ok(Self {
            home,
            agent_id: env::var("SOS_AGENT_ID").unwrap_or_else(|_| "genesis".to_string()),
            strict_capabilities: env_bool("SOS_STRICT_CAPABILITIES", false),
            log_emojis: env_bool("SOS_LOG_EMOJIS", true),
            task_polling_interval: Duration::from_secs(env_u64(
                "SOS_TASK_POLLING_INTERVAL",
                DEFAULT_TASK_POLLING_INTERVAL,
            )),
            auto_claim_enabled: env_bool("SOS_AUTO_CLAIM_ENABLED", true),
            auto_execute_enabled: env_bool("SOS_AUTO_EXECUTE_ENABLED", true),
            auto_report_enabled: env_bool("SOS_AUTO_REPORT_ENABLED", true),
            worker_queue: env::var("SOS_WORKER_QUEUE")
                .unwrap_or_else(|_| sos_bus::GLOBAL_QUEUE.to_string()),
            worker_timeout: Duration::from_secs(env_u64(
                "SOS_WORKER_TIMEOUT",
                DEFAULT_WORKER_TIMEOUT,
            )),
            bind_addr,
            memory_url: env::var("SOS_MEMORY_URL").ok().filter(|v| !v.is_empty()),
            economy_url: env::var("SOS_ECONOMY_URL").ok().filter(|v| !v.is_empty()),
            redis_url: env::var("SOS_REDIS_URL").ok().filter(|v| !v.is_empty()),
            queue_depth_limit: env_u64("SOS_QUEUE_DEPTH_LIMIT", DEFAULT_QUEUE_DEPTH_LIMIT as u64)
                as usize,
            secret_key: env::var("SOS_SECRET_KEY").ok().map(Secret::new),
            issuer_seed: env::var("SOS_ISSUER_KEY").ok().map(Secret::new),
        })
    }

    /// A config rooted at `home` with defaults everywhere else; the normal
    /// entry point for tests.
    pub fn for_home(home: PathBuf) -> Self {
        Self {
            home,
            agent_id: "genesis".into(),
            strict_capabilities: false,
            log_emojis: true,
            task_polling_interval: Duration::from_secs(DEFAULT_TASK_POLLING_INTERVAL),
            auto_claim_enabled: true,
            auto_execute_enabled: true,
            auto_report_enabled: true,
            worker_queue: sos_bus::GLOBAL_QUEUE.to_string(),
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT),
            bind_addr: DEFAULT_BIND_ADDR.parse().expect("literal address"),
            memory_url: None,
            economy_url: None,
            redis_url: None,
            queue_depth_limit: DEFAULT_QUEUE_DEPTH_LIMIT,
            secret_key: None,
            issuer_seed: None,
        }
    }

    /// `${SOS_HOME}/tasks`.
    pub fn tasks_dir(&self) -> PathBuf {
        self.home.join("tasks")
    }

    /// `${SOS_HOME}/workers/registry.json`.
    pub fn worker_registry_path(&self) -> PathBuf {
        self.home.join("workers").join("registry.json")
    }

    /// `${SOS_HOME}/data/artifacts`.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("data").join("artifacts")
    }

    /// `${SOS_HOME}/secrets`.
    pub fn secrets_dir(&self) -> PathBuf {
        self.home.join("secrets")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_home() {
        let config = SosConfig::for_home(PathBuf::from("/srv/sos"));
        assert_eq!(config.tasks_dir(), PathBuf::from("/srv/sos/tasks"));
        assert_eq!(
            config.worker_registry_path(),
            PathBuf::from("/srv/sos/workers/registry.json")
        );
        assert_eq!(
            config.artifacts_dir(),
            PathBuf::from("/srv/sos/data/artifacts")
        );
        assert_eq!(config.secrets_dir(), PathBuf::from("/srv/sos/secrets"));
    }

    #[test]
    fn tilde_expansion_uses_home() {
        std::env::set_var("HOME", "/home/sos-test");
        assert_eq!(expand_home("~/.sos"), PathBuf::from("/home/sos-test/.sos"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
