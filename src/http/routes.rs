//! HTTP route definitions

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::rejection::WebSocketUpgradeRejection,
        ws::WebSocketUpgrade,
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::app::AppState;
use crate::geo::{cell_id_for, Vec3};
use crate::http::middleware::permissive_cors;
use crate::ice::IceServer;
use crate::util::time::uptime_secs;
use crate::ws::handler::handle_socket;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/join", post(join_handler))
        .route("/cell/:cell_id", get(cell_ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(permissive_cors))
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_cells: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_cells: state.shards.active_cells(),
        active_players: state.shards.total_players(),
    })
}

// ============================================================================
// Admission endpoint
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    player_id: String,
    position: Vec3,
    /// Accepted for forward compatibility; the session token minted below is
    /// the only credential the cell checks.
    #[serde(default)]
    #[allow(dead_code)]
    auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    cell_id: String,
    cell_web_socket_url: String,
    session_token: String,
    transport_mode: &'static str,
    ice_servers: Vec<IceServer>,
}

async fn join_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<Json<JoinResponse>, AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    if req.player_id.is_empty() {
        return Err(AppError::BadRequest(
            "playerId must be a non-empty string".to_string(),
        ));
    }
    if !req.position.is_finite() {
        return Err(AppError::BadRequest(
            "position components must be finite".to_string(),
        ));
    }

    let cell_id = cell_id_for(req.position);
    let session_token = mint_session_token();

    state
        .shards
        .handle(&cell_id)
        .prepare(req.player_id.clone(), session_token.clone())
        .await
        .map_err(|e| {
            warn!(cell_id = %cell_id, error = %e, "Cell pre-registration failed");
            AppError::Internal(format!("cell pre-registration failed: {}", e))
        })?;

    info!(cell_id = %cell_id, player_id = %req.player_id, "Admission granted");

    Ok(Json(JoinResponse {
        cell_web_socket_url: cell_websocket_url(&headers, &cell_id),
        cell_id,
        session_token,
        transport_mode: state.flags.transport_mode(),
        ice_servers: state.ice.resolve().await,
    }))
}

/// 128 bits of randomness, URL-safe base64 without padding
fn mint_session_token() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the shard-channel URL from the request's scheme and host,
/// honoring forwarded headers from any fronting proxy.
fn cell_websocket_url(headers: &HeaderMap, cell_id: &str) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let ws_scheme = if proto.eq_ignore_ascii_case("https") {
        "wss"
    } else {
        "ws"
    };
    format!("{}://{}/cell/{}", ws_scheme, host, cell_id)
}

// ============================================================================
// Shard-channel upgrade
// ============================================================================

async fn cell_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(cell_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(upgrade) => {
            let shards = state.shards.clone();
            upgrade.on_upgrade(move |socket| handle_socket(socket, cell_id, shards))
        }
        Err(_) => StatusCode::UPGRADE_REQUIRED.into_response(),
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
