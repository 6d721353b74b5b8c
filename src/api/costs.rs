//! `GET /costs` and `POST /costs?action=reset` — process-lifetime token/cost
//! accounting, per spec §4.10.
//!
//! No teacher analog (the cost-optimization router tracked traffic, not
//! spend); grounded on the shape of the teacher's other JSON admin
//! endpoints (`api/admin.rs`'s `config()` handler: plain `Json(...)`
//! response, no pagination).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::{Query, State}, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::router::ProxyCore;

#[derive(Debug, Deserialize)]
pub struct CostsQuery {
    action: Option<String>,
}

/// `GET /costs` — snapshot. `POST /costs?action=reset` — zero the ledger.
///
/// Axum dispatches by method via the router (`get(...).post(...)`), so this
/// single handler only needs to branch on the query string for the reset
/// case; a plain `GET` never carries `action=reset`.
pub async fn costs(State(core): State<Arc<ProxyCore>>, Query(q): Query<CostsQuery>) -> impl IntoResponse {
    if q.action.as_deref() == Some("reset") {
        core.cost.reset();
    }

    let snapshot = core.cost.snapshot();
    let total_input_usd: f64 = snapshot.iter().map(|r| r.input_usd).sum();
    let total_output_usd: f64 = snapshot.iter().map(|r| r.output_usd).sum();

    let mut by_model: HashMap<String, serde_json::Value> = HashMap::new();
    for record in &snapshot {
        by_model.insert(format!("{}/{}", record.backend, record.model), json!(record));
    }

    Json(json!({
        "total_usd": total_input_usd + total_output_usd,
        "by_backend_model": by_model,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn reset_action_zeroes_ledger() {
        let core = core();
        core.cost.record("openai", "gpt-4o", 1000, 500);

        let response = costs(State(core.clone()), Query(CostsQuery { action: Some("reset".into()) }))
            .await
            .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["total_usd"], 0.0);
    }

    #[tokio::test]
    async fn get_without_action_reports_current_totals() {
        let core = core();
        core.cost.record("openai", "gpt-4o", 1_000_000, 0);

        let response = costs(State(core), Query(CostsQuery { action: None })).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["total_usd"].as_f64().unwrap() > 0.0);
    }
}
