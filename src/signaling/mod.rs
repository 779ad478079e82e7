#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::routing::RoutingCore;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Maximum signaling frame size. RTP parameter blobs are a few KiB; anything
/// bigger is garbage.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Shared state handed to every session.
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub routing: Arc<RoutingCore>,
    pub metrics: ServerMetrics,
    pub config: Arc<Config>,
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    state: Arc<AppState>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(
        admission: Arc<AdmissionController>,
        routing: Arc<RoutingCore>,
        metrics: ServerMetrics,
        config: Arc<Config>,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        info!("Max connections: {}", max_connections);
        Self {
            state: Arc::new(AppState {
                admission,
                routing,
                metrics,
                config,
            }),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let channels = server.state.routing.channels().channel_count();
    let clients = server.state.routing.clients().active_count();
    Json(serde_json::json!({
        "status": "ok",
        "channels": channels,
        "clients": clients,
    }))
}

/// Metrics handler — Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let channels = server.state.routing.channels().channel_count();
    let clients = server.state.routing.clients().active_count();
    let body = server.state.metrics.render_prometheus(channels, clients);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, Arc::clone(&server.state), permit)
        })
}
