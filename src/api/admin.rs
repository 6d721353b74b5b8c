//! `GET /admin/config` — operator-facing config introspection, secrets
//! redacted.
//!
//! The teacher ran this on a separate admin port with its own auth scheme
//! (`api/admin_auth.rs`) and several more routes (`/admin/health`,
//! `/admin/traffic`, `/admin/backends/health`); this proxy folds everything
//! onto one listener behind the shared-secret [`crate::api::auth_mw`], and
//! the other three routes are superseded by `/health`, `/metrics`, and
//! [`crate::upstream::UpstreamClient::health_check`] respectively.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::router::ProxyCore;

/// `GET /admin/config` — current config with secrets redacted (env var
/// names shown, resolved values never are).
pub async fn config(State(core): State<Arc<ProxyCore>>) -> impl IntoResponse {
    let cfg = core.config().await;

    let backends: Vec<Value> = cfg
        .backends
        .iter()
        .map(|(name, b)| {
            json!({
                "name": name,
                "base_url": b.base_url,
                "api_key_env": b.api_key_env,
                "style": b.style.to_string(),
                "timeout_ms": b.timeout_ms,
            })
        })
        .collect();

    let tiers: Vec<Value> = cfg
        .tiers
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "backend": t.backend,
                "model": t.model,
                "fallback": t.fallback,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "port": cfg.gateway.port,
            "recent_log_capacity": cfg.gateway.recent_log_capacity,
            "total_timeout_secs": cfg.gateway.total_timeout_secs,
            "shutdown_grace_secs": cfg.gateway.shutdown_grace_secs,
            "ping_interval_secs": cfg.gateway.ping_interval_secs,
        },
        "backends": backends,
        "tiers": tiers,
        "aliases": cfg.aliases,
        "default_tier": cfg.default_tier,
        "breaker": cfg.breaker,
        "queue": cfg.queue,
        "cache": cfg.cache,
        "rate_limit": cfg.rate_limit,
        "auth": {
            "enabled": cfg.auth.shared_secret_env.is_some(),
            "shared_secret_env": cfg.auth.shared_secret_env,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn redacts_secret_value_shows_env_name_only() {
        std::env::set_var("ANTHROBRIDGE_TEST_ADMIN_SECRET", "super-secret-value");
        let config = crate::config::Config {
            gateway: Default::default(),
            backends: Default::default(),
            tiers: vec![],
            aliases: Default::default(),
            default_tier: None,
            breaker: Default::default(),
            queue: Default::default(),
            cache: Default::default(),
            rate_limit: Default::default(),
            auth: crate::config::AuthConfig {
                shared_secret_env: Some("ANTHROBRIDGE_TEST_ADMIN_SECRET".into()),
            },
        };
        let core = Arc::new(ProxyCore::new(Arc::new(config), PathBuf::default()));

        let response = config(State(core)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("ANTHROBRIDGE_TEST_ADMIN_SECRET"));
        assert!(!text.contains("super-secret-value"));
        std::env::remove_var("ANTHROBRIDGE_TEST_ADMIN_SECRET");
    }
}
