//! Rate-limit middleware — second stage of the pipeline (after auth, before
//! cache/routing).
//!
//! Generalizes the teacher's `api/rate_limit.rs` (per-IP `DashMap` bucket,
//! `Retry-After`/`x-ratelimit-*` response headers) to key on the presented
//! credential when auth is enabled, falling back to source IP otherwise, via
//! [`crate::ratelimit::ClientId`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Extension, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

use crate::api::auth_mw::PresentedCredential;
use crate::error::AppError;
use crate::ratelimit::ClientId;
use crate::router::ProxyCore;

pub async fn rate_limit_middleware(
    State(core): State<Arc<ProxyCore>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    presented: Option<Extension<PresentedCredential>>,
    req: Request,
    next: Next,
) -> Response {
    let client_id = match presented.and_then(|Extension(PresentedCredential(c))| c) {
        Some(cred) => ClientId::from_api_key(&cred),
        None => ClientId::Addr(addr.ip()),
    };

    match core.rate_limiter.check(&client_id) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            let mut response = axum::response::IntoResponse::into_response(AppError::rate_limited(retry_after));
            if let Ok(v) = HeaderValue::from_str(&retry_after.ceil().to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
            response
        }
    }
}
