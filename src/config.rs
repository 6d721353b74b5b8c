//! Configuration types for the proxy.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [backends.openai]
//! base_url = "https://api.openai.com"
//! api_key_env = "OPENAI_API_KEY"
//! style = "chat_completions"
//!
//! [[tiers]]
//! name    = "sonnet"
//! backend = "openai"
//! model   = "gpt-4o"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which wire dialect a backend speaks.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    /// Standard OpenAI `/v1/chat/completions` protocol. Also covers
    /// OpenRouter and any other OpenAI-compatible endpoint (including
    /// locally-hosted ones such as Ollama's compat layer).
    #[default]
    ChatCompletions,
    /// OpenAI's Responses API — reasoning-family models, stricter tool
    /// schema rules (see `translate::outbound`).
    Responses,
    /// Azure OpenAI — `{endpoint}/openai/deployments/{deployment}` path
    /// shape, `api-key` header instead of `Authorization`.
    Azure,
    /// Native Anthropic Messages API — forwarded byte-identical after auth
    /// header substitution, no schema translation.
    AnthropicNative,
}

impl std::fmt::Display for ApiStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ChatCompletions => "chat_completions",
            Self::Responses => "responses",
            Self::Azure => "azure",
            Self::AnthropicNative => "anthropic_native",
        })
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Named upstream backends.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Routing tiers — keyword (opus/sonnet/haiku) → backend + model.
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Explicit model name → tier name overrides, checked before keyword
    /// matching.
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// The tier used when no keyword or alias matches.
    #[serde(default)]
    pub default_tier: Option<String>,

    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for tier in &self.tiers {
            anyhow::ensure!(
                self.backends.contains_key(&tier.backend),
                "tier `{}` references unknown backend `{}`",
                tier.name,
                tier.backend
            );
            if let Some(fallback) = &tier.fallback {
                anyhow::ensure!(
                    self.tiers.iter().any(|t| &t.name == fallback),
                    "tier `{}` fallback references unknown tier `{}`",
                    tier.name,
                    fallback
                );
            }
        }

        let tier_names: std::collections::HashSet<&str> =
            self.tiers.iter().map(|t| t.name.as_str()).collect();

        for (alias, tier) in &self.aliases {
            anyhow::ensure!(
                tier_names.contains(tier.as_str()),
                "alias `{}` maps to unknown tier `{}`",
                alias,
                tier
            );
        }

        if let Some(default_tier) = &self.default_tier {
            anyhow::ensure!(
                tier_names.contains(default_tier.as_str()),
                "default_tier references unknown tier `{}`",
                default_tier
            );
        }

        if let Some(global_fallback) = &self.queue.global_fallback_tier {
            anyhow::ensure!(
                tier_names.contains(global_fallback.as_str()),
                "queue.global_fallback_tier references unknown tier `{}`",
                global_fallback
            );
        }

        Ok(())
    }

    /// Resolve a requested model name to a tier name.
    ///
    /// Order: explicit alias, then opus/sonnet/haiku substring match
    /// (case-insensitive), then `default_tier`.
    pub fn resolve_tier_name(&self, model: &str) -> Option<&str> {
        if let Some(tier) = self.aliases.get(model) {
            return Some(tier.as_str());
        }

        let lower = model.to_ascii_lowercase();
        for keyword in ["opus", "sonnet", "haiku"] {
            if lower.contains(keyword) && self.tiers.iter().any(|t| t.name == keyword) {
                return Some(keyword);
            }
        }

        self.default_tier.as_deref()
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }
}

/// Core proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listener port (default: 8080). All endpoints share one port.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Number of recent requests to keep in the in-memory activity log.
    #[serde(default = "defaults::recent_log_capacity")]
    pub recent_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Total client-to-upstream deadline in seconds (default: 600, to
    /// accommodate long streaming responses).
    #[serde(default = "defaults::total_timeout_secs")]
    pub total_timeout_secs: u64,

    /// Grace period for in-flight requests on SIGINT/SIGTERM (default: 30s).
    #[serde(default = "defaults::shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Interval between heartbeat `ping` SSE events when upstream is silent
    /// (default: 15s).
    #[serde(default = "defaults::ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            recent_log_capacity: defaults::recent_log_capacity(),
            log_level: None,
            total_timeout_secs: defaults::total_timeout_secs(),
            shutdown_grace_secs: defaults::shutdown_grace_secs(),
            ping_interval_secs: defaults::ping_interval_secs(),
        }
    }
}

/// A named upstream backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL, no trailing slash.
    pub base_url: String,

    /// Environment variable name whose value is the API key. Leave unset
    /// for keyless local backends.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds (default: 30 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Wire dialect this backend speaks.
    #[serde(default)]
    pub style: ApiStyle,

    /// Azure only: the deployment name that becomes part of the URL path.
    #[serde(default)]
    pub azure_deployment: Option<String>,
    /// Azure only: the `api-version` query parameter.
    #[serde(default)]
    pub azure_api_version: Option<String>,
}

impl BackendConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

/// A routing tier — a named combination of backend + model, with an
/// optional tier-level fallback consulted before the global fallback.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    /// Unique tier name. Matched against the three hardcoded keywords
    /// (`opus`, `sonnet`, `haiku`) or referenced by alias/default.
    pub name: String,
    pub backend: String,
    pub model: String,
    /// Another tier name to try if this tier's breaker is open.
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "defaults::recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "defaults::breaker_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            recovery_threshold: defaults::recovery_threshold(),
            timeout_secs: defaults::breaker_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::queue_max_size")]
    pub max_size: usize,
    #[serde(default = "defaults::queue_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "defaults::queue_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "defaults::queue_max_retries")]
    pub max_retries: u32,
    /// Tier tried when every tier in the resolved chain has an open breaker.
    #[serde(default)]
    pub global_fallback_tier: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: defaults::queue_max_size(),
            max_wait_secs: defaults::queue_max_wait_secs(),
            retry_delay_ms: defaults::queue_retry_delay_ms(),
            max_retries: defaults::queue_max_retries(),
            global_fallback_tier: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::cache_max_size")]
    pub max_size: u64,
    #[serde(default = "defaults::cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: defaults::cache_max_size(),
            ttl_secs: defaults::cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Requests allowed per `window_secs`.
    #[serde(default = "defaults::rate_limit_requests")]
    pub requests: u32,
    #[serde(default = "defaults::rate_limit_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests: defaults::rate_limit_requests(),
            window_secs: defaults::rate_limit_window_secs(),
            burst: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Environment variable whose value is the shared secret required on
    /// `x-api-key` or `Authorization: Bearer`. Leave unset to disable auth.
    #[serde(default)]
    pub shared_secret_env: Option<String>,
}

impl AuthConfig {
    pub fn shared_secret(&self) -> Option<String> {
        self.shared_secret_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn recent_log_capacity() -> usize { 500 }
    pub fn total_timeout_secs() -> u64 { 600 }
    pub fn shutdown_grace_secs() -> u64 { 30 }
    pub fn ping_interval_secs() -> u64 { 15 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn failure_threshold() -> u32 { 5 }
    pub fn recovery_threshold() -> u32 { 2 }
    pub fn breaker_timeout_secs() -> u64 { 30 }
    pub fn queue_max_size() -> usize { 100 }
    pub fn queue_max_wait_secs() -> u64 { 30 }
    pub fn queue_retry_delay_ms() -> u64 { 500 }
    pub fn queue_max_retries() -> u32 { 3 }
    pub fn cache_max_size() -> u64 { 1000 }
    pub fn cache_ttl_secs() -> u64 { 300 }
    pub fn rate_limit_requests() -> u32 { 60 }
    pub fn rate_limit_window_secs() -> u64 { 60 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [backends.openai]
            base_url = "https://api.openai.com"

            [[tiers]]
            name    = "sonnet"
            backend = "openai"
            model   = "gpt-4o"

            [[tiers]]
            name    = "haiku"
            backend = "openai"
            model   = "gpt-4o-mini"

            [aliases]
            "my-custom-model" = "sonnet"

            default_tier = "sonnet"
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parses_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn validation_rejects_tier_with_unknown_backend() {
        let mut config = minimal_config();
        config.tiers.push(TierConfig {
            name: "bad".into(),
            backend: "nonexistent".into(),
            model: "x".into(),
            fallback: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_tier_fallback_to_unknown_tier() {
        let mut config = minimal_config();
        config.tiers[0].fallback = Some("no-such-tier".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_alias_to_unknown_tier() {
        let mut config = minimal_config();
        config.aliases.insert("bad".into(), "no-such-tier".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_tier_by_keyword() {
        let config = minimal_config();
        assert_eq!(config.resolve_tier_name("claude-3-5-haiku-20241022"), Some("haiku"));
    }

    #[test]
    fn resolve_tier_by_alias_before_keyword() {
        let config = minimal_config();
        assert_eq!(config.resolve_tier_name("my-custom-model"), Some("sonnet"));
    }

    #[test]
    fn resolve_tier_falls_back_to_default() {
        let config = minimal_config();
        assert_eq!(config.resolve_tier_name("some-unrelated-model"), Some("sonnet"));
    }

    #[test]
    fn gateway_defaults_applied_when_section_absent() {
        let config: Config = toml::from_str(
            r#"
            [backends.x]
            base_url = "http://x"
            [[tiers]]
            name = "sonnet" ; backend = "x" ; model = "m"
            "#,
        )
        .expect("should parse");
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.recent_log_capacity, 500);
        assert!(!config.cache.enabled);
        assert!(!config.rate_limit.enabled);
    }
}
