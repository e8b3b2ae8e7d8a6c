//! Gateway configuration with memory-safe environment loading.
//!
//! Keys are cached as [`Secret`]s and zeroized on drop. The registry
//! refuses to start unless at least one provider key (or the local shim
//! endpoint) is present.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};

use crate::adapters::{AnthropicAdapter, ModelAdapter, OpenAiCompatAdapter};
use crate::DEFAULT_TIMEOUT_SECS;

/// Environment variables the gateway recognizes.
const ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_API_KEYS",
    "OPENAI_API_KEY",
    "OPENAI_API_KEYS",
    "OPENROUTER_API_KEY",
    "OPENROUTER_API_KEYS",
    "LOCAL_LLM_ENDPOINT",
    "SOS_MODEL_PRIMARY",
    "SOS_MODEL_LONG_CONTEXT",
    "SOS_MODEL_FRONTIER",
    "SOS_MODEL_FREE_TIER",
    "SOS_MODEL_LOCAL",
    "SOS_MODEL_TIMEOUT",
    "ANTHROPIC_BASE_URL",
    "OPENAI_BASE_URL",
    "OPENROUTER_BASE_URL",
];

/// Secure environment loader; cached values are zeroized on drop.
struct EnvLoader {
    cache: HashMap<String, Secret<String>>,
}

impl EnvLoader {
    fn new() -> Self {
        let mut cache = HashMap::new();
        for var in ENV_VARS {
            if let Ok(value) = env::var(var) {
                if !value.trim().is_empty() {
                    cache.insert((*var).to_owned(), Secret::new(value));
                }
            }
        }
        debug!(count = cache.len(), "cached gateway environment variables");
        Self { cache }
    }

    /// Key ring from `<VAR>S` (comma-separated) falling back to `<VAR>`.
    fn key_ring(&self, base: &str) -> Vec<Secret<String>> {
        let plural = format!("{base}S");
        if let Some(joined) = self.cache.get(&plural) {
            return joined
                .expose_secret()
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| Secret::new(k.to_owned()))
                .collect();
        }
        self.cache
            .get(base)
            .map(|k| vec![Secret::new(k.expose_secret().clone())])
            .unwrap_or_default()
    }

    fn get_public(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|s| s.expose_secret().clone())
    }

    fn get_numeric(&self, key: &str, default: u64) -> u64 {
        self.get_public(key)
            .and_then(|v| {
                v.parse()
                    .map_err(|e| warn!("failed to parse {key} as numeric: {e}"))
                    .ok()
            })
            .unwrap_or(default)
    }
}

/// Resolved gateway configuration.
pub struct GatewayConfig {
    anthropic_keys: Vec<Secret<String>>,
    openai_keys: Vec<Secret<String>>,
    openrouter_keys: Vec<Secret<String>>,
    local_endpoint: Option<String>,
    model_primary: String,
    model_long_context: String,
    model_frontier: String,
    model_free_tier: String,
    model_local: String,
    anthropic_base_url: Option<String>,
    openai_base_url: String,
    openrouter_base_url: String,
    timeout: Duration,
}

impl GatewayConfig {
    /// Load from the environment.
    ///
    /// Fails when no provider key and no local endpoint are configured:
    /// a gateway with zero adapters is a misconfiguration, not a degraded
    /// mode.
    pub fn from_env() -> Result<Self> {
        let loader = EnvLoader::new();
        let config = Self {
            anthropic_keys: loader.key_ring("ANTHROPIC_API_KEY"),
            openai_keys: loader.key_ring("OPENAI_API_KEY"),
            openrouter_keys: loader.key_ring("OPENROUTER_API_KEY"),
            local_endpoint: loader.get_public("LOCAL_LLM_ENDPOINT"),
            model_primary: loader
                .get_public("SOS_MODEL_PRIMARY")
                .unwrap_or_else(|| "claude-3-5-sonnet-20241022".into()),
            model_long_context: loader
                .get_public("SOS_MODEL_LONG_CONTEXT")
                .unwrap_or_else(|| "gpt-4-turbo".into()),
            model_frontier: loader
                .get_public("SOS_MODEL_FRONTIER")
                .unwrap_or_else(|| "claude-3-opus-20240229".into()),
            model_free_tier: loader
                .get_public("SOS_MODEL_FREE_TIER")
                .unwrap_or_else(|| "meta-llama/llama-3.1-8b-instruct:free".into()),
            model_local: loader
                .get_public("SOS_MODEL_LOCAL")
                .unwrap_or_else(|| "llama3".into()),
            anthropic_base_url: loader.get_public("ANTHROPIC_BASE_URL"),
            openai_base_url: loader
                .get_public("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".into()),
            openrouter_base_url: loader
                .get_public("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api".into()),
            timeout: Duration::from_secs(loader.get_numeric("SOS_MODEL_TIMEOUT", DEFAULT_TIMEOUT_SECS)),
        };
        if config.anthropic_keys.is_empty()
            && config.openai_keys.is_empty()
            && config.openrouter_keys.is_empty()
            && config.local_endpoint.is_none()
        {
            anyhow::bail!(
                "no model provider configured: set at least one of ANTHROPIC_API_KEY, \
                 OPENAI_API_KEY, OPENROUTER_API_KEY, or LOCAL_LLM_ENDPOINT"
            );
        }
        Ok(config)
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the v1 adapter roster from this configuration.
    ///
    /// Layer 1 holds the primary preview model, the long-context model, and
    /// the frontier model; layer 2 the free-tier fallback; layer 3 the
    /// local shim. Adapters whose keys are absent are simply not built.
    pub fn build_adapters(&self) -> Result<Vec<Arc<dyn ModelAdapter>>> {
        let mut adapters: Vec<Arc<dyn ModelAdapter>> = Vec::new();

        if !self.anthropic_keys.is_empty() {
            adapters.push(Arc::new(
                AnthropicAdapter::new(
                    "anthropic-primary",
                    clone_keys(&self.anthropic_keys),
                    &self.model_primary,
                    self.anthropic_base_url.as_deref(),
                    1,
                    self.timeout,
                )
                .context("anthropic primary adapter")?,
            ));
            adapters.push(Arc::new(
                AnthropicAdapter::new(
                    "anthropic-frontier",
                    clone_keys(&self.anthropic_keys),
                    &self.model_frontier,
                    self.anthropic_base_url.as_deref(),
                    1,
                    self.timeout,
                )
                .context("anthropic frontier adapter")?,
            ));
        }

        if !self.openai_keys.is_empty() {
            adapters.push(Arc::new(
                OpenAiCompatAdapter::new(
                    "openai-long-context",
                    clone_keys(&self.openai_keys),
                    &self.model_long_context,
                    &self.openai_base_url,
                    1,
                    self.timeout,
                    true,
                )
                .context("long-context adapter")?,
            ));
        }

        if !self.openrouter_keys.is_empty() {
            adapters.push(Arc::new(
                OpenAiCompatAdapter::new(
                    "openrouter-free",
                    clone_keys(&self.openrouter_keys),
                    &self.model_free_tier,
                    &self.openrouter_base_url,
                    2,
                    self.timeout,
                    true,
                )
                .context("free-tier adapter")?,
            ));
        }

        if let Some(endpoint) = &self.local_endpoint {
            adapters.push(Arc::new(
                OpenAiCompatAdapter::new(
                    "local-shim",
                    Vec::new(),
                    &self.model_local,
                    endpoint,
                    3,
                    self.timeout,
                    false,
                )
                .context("local shim adapter")?,
            ));
        }

        if adapters.is_empty() {
            anyhow::bail!("adapter roster is empty after configuration");
        }
        Ok(adapters)
    }
}

fn clone_keys(keys: &[Secret<String>]) -> Vec<Secret<String>> {
    keys.iter()
        .map(|k| Secret::new(k.expose_secret().clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them serialized in one test.
    #[test]
    fn roster_and_refusal() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
        assert!(GatewayConfig::from_env().is_err());

        env::set_var("ANTHROPIC_API_KEYS", "sk-ant-a, sk-ant-b");
        env::set_var("LOCAL_LLM_ENDPOINT", "http://127.0.0.1:11434");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.anthropic_keys.len(), 2);

        let adapters = config.build_adapters().unwrap();
        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        assert!(names.contains(&"anthropic-primary"));
        assert!(names.contains(&"anthropic-frontier"));
        assert!(names.contains(&"local-shim"));
        // No OpenAI key: no long-context adapter.
        assert!(!names.contains(&"openai-long-context"));
        let shim = adapters.iter().find(|a| a.name() == "local-shim").unwrap();
        assert_eq!(shim.layer(), 3);
        assert_eq!(shim.key_count(), 0);

        env::remove_var("ANTHROPIC_API_KEYS");
        env::remove_var("LOCAL_LLM_ENDPOINT");
    }
}
