mod cli;
mod config;
mod host;
mod registry;
mod relay;
mod telemetry;
mod visitor;
mod websocket;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use hickory_resolver::TokioAsyncResolver;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    registry::ConnectionRegistry,
    relay::DeliveryRelay,
    telemetry::Telemetry,
};

/// Shared state behind every route. The registry is the only mutable piece;
/// everything else is read-only after startup.
pub struct AppState {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pub relay: DeliveryRelay,
    pub resolver: Option<TokioAsyncResolver>,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_hosts: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Host {
            server_url,
            legacy_backoff,
        }) => cli::run_host_client(server_url, legacy_backoff).await,
        Some(Commands::Serve) | None => serve(telemetry.metrics_handle()).await,
    }
}

async fn serve(metrics: PrometheusHandle) -> Result<()> {
    let config = Config::from_env();
    info!(
        port = config.port,
        reverse_dns = config.reverse_dns_enabled,
        "starting lookout relay"
    );

    let resolver = if config.reverse_dns_enabled {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(err) => {
                warn!(error = %err, "system resolver unavailable; reverse dns disabled");
                None
            }
        }
    } else {
        None
    };

    let registry = ConnectionRegistry::new();
    let relay = DeliveryRelay::new(registry.clone());
    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        relay,
        resolver,
        metrics,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("lookout listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!("shutdown complete");
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/host/:token", get(websocket::host_socket_handler))
        .route("/share-with/:token", get(visitor::share_link_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatsResponse {
        active_hosts: state.registry.len(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
