//! HTTP surface: route table and middleware stack.
//!
//! Generalizes the teacher's dual client/admin-port split (`api::client`,
//! `api::admin` on separate listeners) into a single listener, since this
//! proxy has one shared-secret identity rather than per-client routing
//! profiles requiring network-level separation. Middleware order is the
//! spec invariant: auth, then rate limiting, then the handler (which does
//! cache lookup, then routing).

pub mod admin;
pub mod auth_mw;
pub mod costs;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod rate_limit_mw;
pub mod request_id;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::router::ProxyCore;

pub fn router(core: Arc<ProxyCore>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::messages))
        .route("/metrics", get(metrics::metrics))
        .route("/metrics/prometheus", get(metrics::metrics_prometheus))
        .route("/costs", get(costs::costs).post(costs::costs))
        .route("/admin/config", get(admin::config))
        .layer(middleware::from_fn_with_state(Arc::clone(&core), rate_limit_mw::rate_limit_middleware))
        .layer(middleware::from_fn_with_state(Arc::clone(&core), auth_mw::auth_middleware))
        .route("/health", get(health::health))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .with_state(core)
}
