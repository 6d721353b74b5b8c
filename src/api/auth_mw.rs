//! Shared-secret auth middleware — the first stage of the pipeline (spec
//! invariant: auth before rate limiting before cache before routing).
//!
//! Grounded in the teacher's `client_auth.rs` middleware shape
//! (`from_fn_with_state`, extension injection for the next stage to read),
//! but delegates the actual check to [`crate::auth`] instead of the
//! teacher's per-client key map.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::auth::{self, AuthOutcome};
use crate::error::AppError;
use crate::router::ProxyCore;

/// The credential presented on this request, if any — set so the rate
/// limiter middleware can key on it without re-parsing headers.
#[derive(Clone, Debug)]
pub struct PresentedCredential(pub Option<String>);

pub async fn auth_middleware(State(core): State<Arc<ProxyCore>>, mut req: Request, next: Next) -> Response {
    let config = core.config().await;
    let shared_secret = config.auth.shared_secret();
    let presented = auth::extract_credential(req.headers());

    match auth::check(shared_secret.as_deref(), presented.as_deref()) {
        AuthOutcome::Admitted => {
            req.extensions_mut().insert(PresentedCredential(presented));
            next.run(req).await
        }
        AuthOutcome::Missing => AppError::unauthenticated().into_response_public(),
        AuthOutcome::Wrong => AppError::forbidden().into_response_public(),
    }
}

impl AppError {
    /// `into_response` requires `Self: Sized` and consumes `self` — this is
    /// just a readability alias used at the two call sites above.
    fn into_response_public(self) -> Response {
        axum::response::IntoResponse::into_response(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::config::{AuthConfig, Config};

    fn core_with_secret(secret: Option<&str>) -> Arc<ProxyCore> {
        if let Some(s) = secret {
            std::env::set_var("TEST_SHARED_SECRET", s);
        }
        let mut config = Config {
            auth: AuthConfig { shared_secret_env: secret.map(|_| "TEST_SHARED_SECRET".to_string()) },
            ..blank_config()
        };
        if secret.is_none() {
            config.auth = AuthConfig::default();
        }
        Arc::new(ProxyCore::new(Arc::new(config), std::path::PathBuf::default()))
    }

    fn blank_config() -> Config {
        Config {
            gateway: Default::default(),
            backends: Default::default(),
            tiers: vec![],
            aliases: Default::default(),
            default_tier: None,
            breaker: Default::default(),
            queue: Default::default(),
            cache: Default::default(),
            rate_limit: Default::default(),
            auth: Default::default(),
        }
    }

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(core: Arc<ProxyCore>) -> Router {
        Router::new()
            .route("/", get(ok))
            .layer(middleware::from_fn_with_state(core.clone(), auth_middleware))
            .with_state(core)
    }

    #[tokio::test]
    async fn disabled_auth_passes_through() {
        let core = core_with_secret(None);
        let resp = app(core).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credential_is_401() {
        let core = core_with_secret(Some("s3cr3t"));
        let resp = app(core).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_credential_is_403() {
        let core = core_with_secret(Some("s3cr3t"));
        let resp = app(core)
            .oneshot(Request::get("/").header("x-api-key", "wrong").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn matching_credential_is_admitted() {
        let core = core_with_secret(Some("s3cr3t"));
        let resp = app(core)
            .oneshot(Request::get("/").header("x-api-key", "s3cr3t").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
