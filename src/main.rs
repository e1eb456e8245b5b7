//! Site aggregator service: binary entrypoint.
//! Loads configuration, wires the coordinator, starts the hourly scheduler and
//! serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use site_aggregator::metrics::Metrics;
use site_aggregator::{api, AppConfig, AppState, JobCoordinator, ReqwestTransport};

/// `RUST_LOG` filter (default `site_aggregator=info,warn`); `LOG_FORMAT=json`
/// switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("site_aggregator=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading site configuration")?;
    let metrics = Metrics::init(cfg.cache.ttl_secs).context("installing metrics recorder")?;

    let transport = Arc::new(ReqwestTransport::new().context("building http client")?);
    let coordinator = Arc::new(
        JobCoordinator::from_config(&cfg, transport).context("building coordinator")?,
    );

    let state = AppState::new(coordinator);
    state.scheduler.start();

    let app = api::router(state.clone()).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind_addr))?;
    info!(addr = %cfg.server.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    state.scheduler.stop();
    Ok(())
}
