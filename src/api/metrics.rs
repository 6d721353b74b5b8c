//! `GET /metrics` (JSON) and `GET /metrics/prometheus` (text) — both render
//! the same underlying [`crate::cost::RecentRequestLog`] and
//! [`crate::breaker::BreakerRegistry`] state, per spec §6 listing them as two
//! distinct routes rather than one format.
//!
//! Grounded in the teacher's `api/metrics.rs` (the `lmg_*` metric family
//! naming, `# HELP`/`# TYPE` rendering, per-tier/backend aggregation loop),
//! adapted from the teacher's ring-buffer-only `TrafficLog` to this proxy's
//! [`RecentRequestLog`] plus queue depth and breaker state, which the
//! teacher's cost-optimization router had no equivalent of.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::router::ProxyCore;

/// `GET /metrics` — JSON summary: recent-request stats, queue depth, uptime.
pub async fn metrics(State(core): State<Arc<ProxyCore>>) -> impl IntoResponse {
    let stats = core.recent_log.stats().await;
    let queue_len = core.queue.len().await;

    Json(json!({
        "uptime_secs": core.started_at.elapsed().as_secs(),
        "requests": stats,
        "queue_depth": queue_len,
    }))
}

/// `GET /metrics/prometheus` — Prometheus text exposition format.
pub async fn metrics_prometheus(State(core): State<Arc<ProxyCore>>) -> impl IntoResponse {
    let entries = core.recent_log.recent(usize::MAX).await;
    let queue_len = core.queue.len().await;

    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();
    let mut errors: u64 = 0;

    for e in &entries {
        if !e.success {
            errors += 1;
        }
        *request_counts.entry((e.tier.clone(), e.backend.clone(), e.success)).or_default() += 1;
        let lat = latency.entry((e.tier.clone(), e.backend.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP anthrobridge_window_size Number of requests currently held in the recent-activity window.\n");
    out.push_str("# TYPE anthrobridge_window_size gauge\n");
    out.push_str(&format!("anthrobridge_window_size {}\n\n", entries.len()));

    out.push_str("# HELP anthrobridge_queue_depth Requests currently waiting in the retry queue.\n");
    out.push_str("# TYPE anthrobridge_queue_depth gauge\n");
    out.push_str(&format!("anthrobridge_queue_depth {queue_len}\n\n"));

    out.push_str("# HELP anthrobridge_requests Request count in the current window, labelled by tier, backend, and outcome.\n");
    out.push_str("# TYPE anthrobridge_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, backend, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "anthrobridge_requests{{tier=\"{tier}\",backend=\"{backend}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP anthrobridge_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier and backend.\n");
    out.push_str("# TYPE anthrobridge_latency_ms_sum gauge\n");
    out.push_str("# HELP anthrobridge_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE anthrobridge_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, backend), (sum, count)) in lat_rows {
        out.push_str(&format!("anthrobridge_latency_ms_sum{{tier=\"{tier}\",backend=\"{backend}\"}} {sum}\n"));
        out.push_str(&format!("anthrobridge_latency_ms_count{{tier=\"{tier}\",backend=\"{backend}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP anthrobridge_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE anthrobridge_errors_total gauge\n");
    out.push_str(&format!("anthrobridge_errors_total {errors}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::RequestLogEntry;
    use std::path::PathBuf;

    fn core() -> Arc<ProxyCore> {
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
            auth: Default::default(),
        };
        Arc::new(ProxyCore::new(Arc::new(config), PathBuf::default()))
    }

    #[tokio::test]
    async fn prometheus_output_reflects_recorded_requests() {
        let core = core();
        core.recent_log.push(RequestLogEntry::new("sonnet".into(), "openai".into(), "gpt-4o".into(), 120, true));
        core.recent_log.push(RequestLogEntry::new("sonnet".into(), "openai".into(), "gpt-4o".into(), 80, false));

        let response = metrics_prometheus(State(core)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("anthrobridge_window_size 2"));
        assert!(text.contains("anthrobridge_errors_total 1"));
    }
}
