use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::gateway;
use crate::registry::SessionRegistry;
use crate::session::SessionSettings;
use crate::transcoder::{self, Transcoder, VersionCheckError};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub transcoder: Arc<dyn Transcoder>,
    pub settings: Arc<SessionSettings>,
    pub metrics: Arc<MetricsRecorder>,
    pub max_send_queue: usize,
    /// Program checked by `/test-ffmpeg`.
    pub ffmpeg_program: String,
}

impl AppState {
    pub fn new(config: &RelayConfig, transcoder: Arc<dyn Transcoder>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            transcoder,
            settings: Arc::new(config.session_settings()),
            metrics,
            max_send_queue: config.max_send_queue,
            ffmpeg_program: config.transcode.program.clone(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/test-ffmpeg", get(test_ffmpeg_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve the relay. Returns a handle used to shut it down.
pub async fn start(
    config: &RelayConfig,
    transcoder: Arc<dyn Transcoder>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config, transcoder, metrics);
    let registry = Arc::clone(&state.registry);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        ffmpeg = %config.transcode.program,
        "Relay server started"
    );

    let stop = CancellationToken::new();
    let server_stop = stop.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_stop.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Relay server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        grace: config.shutdown_grace(),
        stop,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<SessionRegistry>,
    grace: Duration,
    stop: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Terminate every session, wait up to the grace period for their
    /// transcoders to be reaped, then stop the HTTP server.
    pub async fn shutdown(self) {
        self.registry.terminate_all();
        if !self.registry.wait_empty(self.grace).await {
            tracing::warn!(
                remaining = self.registry.count(),
                grace_secs = self.grace.as_secs(),
                "Sessions still open after shutdown grace period"
            );
        }

        self.stop.cancel();
        if tokio::time::timeout(self.grace, self.server).await.is_err() {
            tracing::warn!("HTTP server did not stop within grace period");
        }
        tracing::info!("Relay server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gateway::handle_ws_connection(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let frame_bytes = state.metrics.histogram_summary("relay.frame_bytes", &[]);
    Json(serde_json::json!({
        "status": "ok",
        "activeStreams": state.registry.streaming_count(),
        "sessions": state.registry.count(),
        "framesForwarded": state.metrics.counter_get("relay.frames_forwarded", &[]),
        "framesDropped": state.metrics.counter_get("relay.frames_dropped", &[]),
        "frameBytesP50": frame_bytes.p50,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn sessions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.summaries())
}

async fn test_ffmpeg_handler(State(state): State<AppState>) -> impl IntoResponse {
    match transcoder::check_version(&state.ffmpeg_program).await {
        Ok(version) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "message": "FFmpeg is installed and working",
                "version": version,
            })),
        ),
        Err(VersionCheckError::NotInstalled(e)) => {
            tracing::warn!(program = %state.ffmpeg_program, error = %e, "FFmpeg version check failed to spawn");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": "FFmpeg is not installed",
                    "error": e.to_string(),
                })),
            )
        }
        Err(VersionCheckError::Failed(code)) => {
            tracing::warn!(program = %state.ffmpeg_program, ?code, "FFmpeg version check exited with failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": "FFmpeg is not working correctly",
                })),
            )
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .gauge_set("relay.active_streams", &[], state.registry.streaming_count() as f64);
    Json(state.metrics.snapshot())
}
