//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::{BodyFrame, BodyId, BoardId, SessionId};
use crate::store::{BoardCatalog, BoardMeta, UserProfile};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Longest accepted username
const MAX_USERNAME_LEN: usize = 32;

/// Upper bound for plain HTTP requests; WebSocket upgrades answer immediately
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    Router::new()
        .route("/health", get(health_handler))
        .route("/boards", get(boards_handler))
        .route("/boards/:board_id", get(board_handler))
        .route("/users", post(register_handler))
        .route("/sessions/:session_id/frames", get(frames_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin, otherwise a comma-separated list with credentials
fn cors_layer(client_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return base.allow_origin(Any);
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    base.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    seated_players: usize,
    running_worlds: usize,
    queue_size: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.sessions.active_sessions(),
        seated_players: state.sessions.seated_players(),
        running_worlds: state.runners.active(),
        queue_size: state.matchmaking.queue_size(),
    })
}

// ============================================================================
// Boards and users
// ============================================================================

async fn boards_handler(State(state): State<AppState>) -> Json<Vec<BoardMeta>> {
    Json(state.boards.list())
}

async fn board_handler(
    State(state): State<AppState>,
    Path(board_id): Path<u32>,
) -> Result<Json<BoardMeta>, AppError> {
    state
        .boards
        .meta(BoardId(board_id))
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("board {board_id}")))
}

// ============================================================================
// Frame log of a running simulation
// ============================================================================

#[derive(Serialize)]
struct TickFrame {
    tick: u64,
    #[serde(flatten)]
    frame: BodyFrame,
}

#[derive(Serialize)]
struct FramesResponse {
    session_id: SessionId,
    bodies: BTreeMap<BodyId, Vec<TickFrame>>,
}

/// Frames recorded so far, for clients that join the stream late
async fn frames_handler(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<FramesResponse>, AppError> {
    let log = state
        .runners
        .frames(session_id)
        .ok_or_else(|| AppError::NotFound(format!("no running simulation {session_id}")))?;

    let bodies = log
        .bodies()
        .into_iter()
        .map(|body_id| {
            let frames = log
                .frames_for(body_id)
                .into_iter()
                .map(|(tick, frame)| TickFrame { tick, frame })
                .collect();
            (body_id, frames)
        })
        .collect();

    Ok(Json(FramesResponse { session_id, bodies }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
}

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    let username = req.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(AppError::BadRequest(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters"
        )));
    }

    let profile = state.users.register(username);
    Ok((StatusCode::CREATED, Json(profile)))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
