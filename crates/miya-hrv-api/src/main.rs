//! MIYA HRV - Ventilation Control API Server

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use miya_hrv::{DeviceConfig, DeviceError, MiyaDevice};
use miya_protocol::{ControlFrame, ProtocolError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod websocket;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub device: Arc<MiyaDevice>,
}

/// API response wrapper using serde_json::Value for flexibility
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Map a device error to an HTTP status and error body
fn device_error(e: &DeviceError) -> (StatusCode, Json<ApiResponse>) {
    let status = match e {
        DeviceError::UnknownCommand(_) => StatusCode::NOT_FOUND,
        DeviceError::Protocol(ProtocolError::Validation(_)) => StatusCode::BAD_REQUEST,
        DeviceError::Protocol(ProtocolError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
        DeviceError::Protocol(
            ProtocolError::Connect { .. } | ProtocolError::ConnectTimeout { .. },
        ) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

/// Get connection info
async fn device_info(State(state): State<AppState>) -> impl IntoResponse {
    let device = &state.device;
    Json(ApiResponse::success(serde_json::json!({
        "name": "MIYA HRV",
        "version": env!("CARGO_PKG_VERSION"),
        "address": format!("{:#04x}", device.address()),
        "connection": device.connection_info(),
    })))
}

/// Get the last reported status
async fn device_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.current_status() {
        Some(status) => (StatusCode::OK, Json(ApiResponse::success(status))),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("No status received from device yet")),
        ),
    }
}

/// Ask the device to report its status
async fn refresh_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.refresh().await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({
                "status": "query_sent"
            }))),
        ),
        Err(e) => device_error(&e),
    }
}

/// Connect to the bridge
async fn connect_device(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.connect().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(state.device.connection_info())),
        ),
        Err(e) => device_error(&e),
    }
}

/// Disconnect from the bridge
async fn disconnect_device(State(state): State<AppState>) -> impl IntoResponse {
    state.device.disconnect().await;
    Json(ApiResponse::success(state.device.connection_info()))
}

/// List available commands
async fn list_commands(State(state): State<AppState>) -> impl IntoResponse {
    let commands: Vec<&str> = state.device.commands().names().collect();
    Json(ApiResponse::success(commands))
}

/// Send a named command
async fn send_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.device.send_command(&name).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "command": name
            }))),
        ),
        Err(e) => device_error(&e),
    }
}

/// Set several fields in one control frame
async fn control_device(
    State(state): State<AppState>,
    Json(control): Json<ControlFrame>,
) -> impl IntoResponse {
    if control.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Control request sets no fields")),
        );
    }
    match state.device.send_control(&control).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(control))),
        Err(e) => device_error(&e),
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Load device config from `MIYA_CONFIG` if set, otherwise from the environment
async fn load_config() -> anyhow::Result<DeviceConfig> {
    let config = match std::env::var("MIYA_CONFIG") {
        Ok(path) => DeviceConfig::from_json_file(&path).await?,
        Err(_) => DeviceConfig::from_env()?,
    };
    Ok(config)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/device", get(device_info))
        .route("/api/v1/device/status", get(device_status))
        .route("/api/v1/device/refresh", post(refresh_status))
        .route("/api/v1/device/connect", post(connect_device))
        .route("/api/v1/device/disconnect", post(disconnect_device))
        .route("/api/v1/device/control", post(control_device))
        .route("/api/v1/commands", get(list_commands))
        .route("/api/v1/commands/:name", post(send_command))
        // WebSocket
        .route("/ws", get(ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "miya_hrv_api=debug,miya_hrv=debug,miya_protocol=debug,info".into()
            }),
        )
        .init();

    tracing::info!("Starting MIYA HRV API server");

    let config = load_config().await?;
    let device = Arc::new(MiyaDevice::new(config)?);

    // The transport reconnects on its own once up; an initial failure is
    // retried through POST /api/v1/device/connect
    tracing::info!("Connecting to MIYA bridge at {}", device.transport().config().addr());
    if let Err(e) = device.connect().await {
        tracing::warn!("Initial connection failed: {}", e);
    }

    let state = AppState {
        device: device.clone(),
    };
    let app = router(state);

    // Start server
    let addr = std::env::var("MIYA_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    device.disconnect().await;
    Ok(())
}
