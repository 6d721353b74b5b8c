use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod auth;
mod breaker;
mod cache;
mod config;
mod cost;
mod error;
mod queue;
mod ratelimit;
mod router;
mod translate;
mod types;
mod upstream;

pub use config::Config;
pub use error::AppError;

/// Translating reverse proxy — Anthropic Messages API in front,
/// OpenAI-compatible upstreams behind.
#[derive(Parser, Debug)]
#[command(name = "anthrobridge", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "ANTHROBRIDGE_CONFIG", default_value = "/etc/anthrobridge/config.toml")]
    config: PathBuf,

    /// Probe the running instance's /health endpoint and exit 0/1. Used as
    /// a Docker HEALTHCHECK entrypoint rather than a fresh process start.
    #[arg(long)]
    healthcheck: bool,

    /// Load and validate the config, print it, and exit without binding a
    /// listener.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.healthcheck {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anthrobridge=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let port = config.gateway.port;
    let shutdown_grace = Duration::from_secs(config.gateway.shutdown_grace_secs);
    info!(port, "anthrobridge starting");

    let config = Arc::new(config);
    let core = Arc::new(router::ProxyCore::new(Arc::clone(&config), cli.config.clone()));

    tokio::spawn(config_watcher(Arc::clone(&core)));
    tokio::spawn(queue_worker(Arc::clone(&core)));

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(Arc::clone(&core)).layer(trace_layer);

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    match tokio::time::timeout(shutdown_grace + Duration::from_secs(5), serve).await {
        Ok(result) => result.context("server error")?,
        Err(_) => warn!("grace period elapsed with connections still open, exiting anyway"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// `anthrobridge --healthcheck` — GET /health, exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("ANTHROBRIDGE_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);
    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Polls the config file mtime every 5 seconds and hot-reloads on change.
/// Parse failures are logged and ignored; the running config is unchanged.
async fn config_watcher(core: Arc<router::ProxyCore>) {
    let path = core.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_cfg) => {
                core.replace_config(Arc::new(new_cfg)).await;
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed, keeping previous config");
            }
        }
    }
}

/// Drains the request queue on every enqueue notification and again every
/// `retry_delay_ms` (to pick up breaker recovery even with no new arrivals).
/// Popping an item retires its slot and wakes the handler blocked on it in
/// `api::messages::enqueue_and_wait`, which re-checks breaker admission
/// itself — this worker only owns FIFO order and slot lifetime, not routing.
async fn queue_worker(core: Arc<router::ProxyCore>) {
    loop {
        let retry_delay = core.queue.retry_delay();
        tokio::select! {
            _ = core.queue.notify.notified() => {},
            _ = tokio::time::sleep(retry_delay) => {},
        }

        while core.queue.try_dequeue().await.is_some() {}
    }
}
