//! `POST /v1/messages` — the whole translation pipeline.
//!
//! Stage order (spec invariant: auth before rate limit before cache before
//! routing) is enforced by middleware ordering in `api::mod` for auth and
//! rate limiting; this handler picks up from cache lookup onward. Grounded
//! in the teacher's `api/client.rs::chat_completions` handler shape (thin
//! handler delegating to the router, status/JSON translation at the edge),
//! generalized with the breaker/queue/cache stages the teacher's handler
//! didn't have.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::breaker::{Admission, Outcome};
use crate::cache::CacheEntry;
use crate::cost::RequestLogEntry;
use crate::error::AppError;
use crate::queue::EnqueueResult;
use crate::router::{ProxyCore, Resolution, RouteTarget};
use crate::translate::{inbound, outbound, stream as sse_translate};
use crate::types::MessagesRequest;
use crate::upstream::UpstreamClient;

pub async fn messages(
    State(core): State<Arc<ProxyCore>>,
    body: axum::body::Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let config = core.config().await;

    let req: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::invalid_request(format!("malformed request body: {e}")))?;

    let resolution = crate::router::route(&config, &req.model)
        .ok_or_else(|| AppError::invalid_request(format!("no route for model `{}`", req.model)))?;

    if req.stream {
        return stream_response(core, resolution, req, start).await;
    }

    let primary = &resolution.targets[0];
    let raw_body = serde_json::to_value(&req)?;
    let fingerprint = core
        .cache
        .enabled()
        .then(|| crate::cache::ResponseCache::fingerprint(&primary.id.backend, &primary.id.model, &raw_body));

    let core_for_init = Arc::clone(&core);
    let resolution_for_init = resolution.clone();
    let req_for_init = req.clone();

    let entry = match &fingerprint {
        Some(fp) => {
            core.cache
                .get_or_insert_with(fp, || {
                    run_non_streaming(core_for_init, resolution_for_init, req_for_init, start)
                })
                .await?
        }
        None => run_non_streaming(core_for_init, resolution_for_init, req_for_init, start).await?,
    };

    Ok((StatusCode::OK, [("content-type", entry.content_type)], (*entry.body).to_string()).into_response())
}

/// Breaker-admission loop, outbound/inbound translation, cost + log
/// recording for a single non-streaming request. Returns a [`CacheEntry`] so
/// the cache layer can store it directly on a miss.
async fn run_non_streaming(
    core: Arc<ProxyCore>,
    resolution: Resolution,
    req: MessagesRequest,
    start: Instant,
) -> anyhow::Result<CacheEntry> {
    let config = core.config().await;

    match try_targets(&core, &resolution, &req).await {
        Ok((target, resp)) => {
            core.cost.record(
                &target.id.backend,
                &target.id.model,
                resp.usage.input_tokens,
                resp.usage.output_tokens,
            );
            core.recent_log.push(RequestLogEntry::new(
                resolution.tier_name.clone(),
                target.id.backend.clone(),
                target.id.model.clone(),
                start.elapsed().as_millis() as u64,
                true,
            ));
            let body = serde_json::to_value(&resp)?;
            Ok(CacheEntry { body: Arc::new(body), content_type: "application/json" })
        }
        Err(AdmissionOutcome::AllBreakersOpen) => {
            if config.queue.enabled {
                enqueue_and_wait(&core, &resolution, &req, start).await
            } else {
                core.recent_log.push(
                    RequestLogEntry::new(resolution.tier_name.clone(), String::new(), String::new(), start.elapsed().as_millis() as u64, false)
                        .with_error_kind("breaker_open"),
                );
                anyhow::bail!(AppError::new(crate::error::ErrorKind::BreakerOpen, "all routes unavailable (circuit open)"))
            }
        }
        Err(AdmissionOutcome::Failed(e)) => {
            core.recent_log.push(
                RequestLogEntry::new(resolution.tier_name.clone(), String::new(), String::new(), start.elapsed().as_millis() as u64, false)
                    .with_error_kind(e.kind.code()),
            );
            Err(e.into())
        }
    }
}

enum AdmissionOutcome {
    AllBreakersOpen,
    Failed(AppError),
}

/// Try each target in order, respecting breaker admission. Returns the first
/// successful translated response, or `AllBreakersOpen` if every target was
/// refused admission.
async fn try_targets(
    core: &ProxyCore,
    resolution: &Resolution,
    req: &MessagesRequest,
) -> Result<(RouteTarget, crate::types::MessagesResponse), AdmissionOutcome> {
    let config = core.config().await;
    let mut any_admitted = false;

    for target in &resolution.targets {
        if !matches!(core.breakers.admit(&target.id, &config.breaker), Admission::Allowed) {
            continue;
        }
        any_admitted = true;

        match call_target(target, req, config.gateway.total_timeout_secs).await {
            Ok(resp) => {
                core.breakers.record(&target.id, Outcome::Success, &config.breaker);
                return Ok((target.clone(), resp));
            }
            Err(CallError::Client(e)) => {
                core.breakers.record(&target.id, Outcome::ClientError, &config.breaker);
                return Err(AdmissionOutcome::Failed(e));
            }
            Err(CallError::Upstream(e)) => {
                core.breakers.record(&target.id, Outcome::Failure, &config.breaker);
                // Fall through to the next target in the chain.
                let _ = e;
                continue;
            }
        }
    }

    if any_admitted {
        Err(AdmissionOutcome::Failed(AppError::new(
            crate::error::ErrorKind::UpstreamError,
            "every route in the chain failed",
        )))
    } else {
        Err(AdmissionOutcome::AllBreakersOpen)
    }
}

enum CallError {
    /// 4xx other than 408/429 — the request itself is bad, don't retry the
    /// next target, surface the error to the caller as-is.
    Client(AppError),
    /// 5xx/429/timeout/transport failure — safe to retry against the next
    /// fallback target.
    Upstream(AppError),
}

async fn call_target(
    target: &RouteTarget,
    req: &MessagesRequest,
    total_timeout_secs: u64,
) -> Result<crate::types::MessagesResponse, CallError> {
    let client = UpstreamClient::new(target, total_timeout_secs).map_err(|e| CallError::Upstream(e.into()))?;

    let outbound_body = translate_outbound(target, req).map_err(CallError::Client)?;

    let (status, body) = client.send(target, &outbound_body).await.map_err(|e| CallError::Upstream(e.into()))?;

    if status.as_u16() == 429 || status.is_server_error() {
        return Err(CallError::Upstream(AppError::new(
            crate::error::ErrorKind::UpstreamError,
            format!("upstream returned HTTP {status}"),
        )
        .with_upstream_body(body)));
    }
    if !status.is_success() {
        return Err(CallError::Client(
            AppError::new(crate::error::ErrorKind::InvalidRequest, format!("upstream rejected request: HTTP {status}"))
                .with_upstream_body(body),
        ));
    }

    translate_inbound(target, &body, &req.model).map_err(CallError::Client)
}

fn translate_outbound(target: &RouteTarget, req: &MessagesRequest) -> Result<Value, AppError> {
    match target.style {
        crate::config::ApiStyle::ChatCompletions => outbound::to_chat_completions(req),
        crate::config::ApiStyle::Responses => outbound::to_responses_api(req),
        crate::config::ApiStyle::Azure => outbound::to_azure(req),
        crate::config::ApiStyle::AnthropicNative => outbound::to_anthropic_native(req),
    }
}

fn translate_inbound(target: &RouteTarget, body: &Value, requested_model: &str) -> Result<crate::types::MessagesResponse, AppError> {
    match target.style {
        crate::config::ApiStyle::ChatCompletions | crate::config::ApiStyle::Azure => {
            inbound::from_chat_completions(body, requested_model)
        }
        crate::config::ApiStyle::Responses => inbound::from_responses_api(body, requested_model),
        crate::config::ApiStyle::AnthropicNative => inbound::from_anthropic_native(body),
    }
}

/// Queue fallback: every target's breaker is open. Enqueues and waits for the
/// shared background worker (`main::queue_worker`) to pop this request and
/// wake it, then re-checks breaker admission; if still refused, re-enqueues
/// up to `queue.max_retries` times before giving up.
async fn enqueue_and_wait(
    core: &ProxyCore,
    resolution: &Resolution,
    req: &MessagesRequest,
    start: Instant,
) -> anyhow::Result<CacheEntry> {
    let client_id = resolution.tier_name.clone();
    let mut handle = match core.queue.try_enqueue(&client_id).await {
        EnqueueResult::Full => {
            anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueFull, "request queue is full"))
        }
        EnqueueResult::ClientShareExceeded => {
            anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueFull, "client fair-share queue slots exceeded"))
        }
        EnqueueResult::Enqueued(h) => h,
    };

    let mut attempts = 0u32;

    loop {
        let deadline = handle.item.deadline;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueTimeout, "queued request exceeded max wait"));
        }

        // Wait for the background worker to pop us, bounded by our own
        // deadline so an item the worker never reaches still times out.
        match tokio::time::timeout(remaining, handle.woken).await {
            Ok(_) => {}
            Err(_) => {
                anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueTimeout, "queued request exceeded max wait"))
            }
        }

        match try_targets(core, resolution, req).await {
            Ok((target, resp)) => {
                core.cost.record(&target.id.backend, &target.id.model, resp.usage.input_tokens, resp.usage.output_tokens);
                core.recent_log.push(RequestLogEntry::new(
                    resolution.tier_name.clone(),
                    target.id.backend.clone(),
                    target.id.model.clone(),
                    start.elapsed().as_millis() as u64,
                    true,
                ));
                let body = serde_json::to_value(&resp)?;
                return Ok(CacheEntry { body: Arc::new(body), content_type: "application/json" });
            }
            Err(AdmissionOutcome::Failed(e)) => anyhow::bail!(e),
            Err(AdmissionOutcome::AllBreakersOpen) => {
                attempts += 1;
                if attempts >= core.queue.max_retries() {
                    anyhow::bail!(AppError::new(
                        crate::error::ErrorKind::QueueTimeout,
                        "exceeded max queue retries with every route still unavailable"
                    ));
                }
                if Instant::now() >= deadline {
                    anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueTimeout, "queued request exceeded max wait"));
                }
                handle = match core.queue.try_enqueue(&client_id).await {
                    EnqueueResult::Enqueued(h) => h,
                    _ => anyhow::bail!(AppError::new(crate::error::ErrorKind::QueueFull, "request queue is full")),
                };
            }
        }
    }
}

async fn stream_response(
    core: Arc<ProxyCore>,
    resolution: Resolution,
    req: MessagesRequest,
    start: Instant,
) -> Result<Response, AppError> {
    let config = core.config().await;

    let mut admitted_target = None;
    for target in &resolution.targets {
        if matches!(core.breakers.admit(&target.id, &config.breaker), Admission::Allowed) {
            admitted_target = Some(target.clone());
            break;
        }
    }

    let Some(target) = admitted_target else {
        return Err(AppError::new(crate::error::ErrorKind::BreakerOpen, "all routes unavailable (circuit open)"));
    };

    let client = UpstreamClient::new(&target, config.gateway.total_timeout_secs)?;
    let outbound_body = translate_outbound(&target, &req)?;

    let upstream = match client.send_stream(&target, &outbound_body).await {
        Ok(s) => {
            core.breakers.record(&target.id, Outcome::Success, &config.breaker);
            s
        }
        Err(e) => {
            core.breakers.record(&target.id, Outcome::Failure, &config.breaker);
            return Err(AppError::new(crate::error::ErrorKind::UpstreamError, e.to_string()));
        }
    };

    let message_id = format!("msg_{}", uuid::Uuid::new_v4());
    let (tx, rx) = mpsc::channel(32);
    let ping_interval = std::time::Duration::from_secs(config.gateway.ping_interval_secs);

    let core_for_task = Arc::clone(&core);
    let tier_name = resolution.tier_name.clone();
    let target_id = target.id.clone();
    let model = target.model.clone();

    tokio::spawn(async move {
        let usage = sse_translate::drive(upstream, message_id, model.clone(), ping_interval, tx).await;
        core_for_task.cost.record(&target_id.backend, &target_id.model, usage.input_tokens, usage.output_tokens);
        core_for_task.recent_log.push(RequestLogEntry::new(
            tier_name,
            target_id.backend.clone(),
            target_id.model.clone(),
            start.elapsed().as_millis() as u64,
            true,
        ));
    });

    let events = sse_translate::into_stream(rx).map(|evt| {
        Ok::<_, std::convert::Infallible>(Event::default().event(evt.event).data(evt.data.to_string()))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(ping_interval)).into_response())
}
