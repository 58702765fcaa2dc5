//! Signaling relay: pairs at most two clients per named room, elects one of
//! them as the initiator and forwards opaque negotiation payloads between
//! them until they hold a direct channel of their own.

pub mod config;
pub mod rooms;
pub mod telemetry;
pub mod websocket;

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::RelayConfig;
pub use rooms::RoomRegistry;

pub struct RelayState {
    pub registry: RoomRegistry,
    pub config: RelayConfig,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Arc<Self> {
        Arc::new(Self {
            registry: RoomRegistry::new(),
            config,
            metrics,
        })
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("relay server exited with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn rooms_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let rooms = state.registry.snapshot();
    Json(json!({
        "active_rooms": rooms.len(),
        "active_members": state.registry.member_count(),
        "rooms": rooms,
    }))
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
