// VPN Client - REST API Module
// HTTP endpoints for profile control, status and the event stream

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use vpn_client_common::{Error, ProfileConfig, StatusResponse};

use crate::autoclean::CleanupWatch;
use crate::gateway::StatusGateway;
use crate::manager::StartOutcome;

/// Shared application state
pub struct AppState {
    pub gateway: StatusGateway,
    pub cleanup: Arc<dyn CleanupWatch>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/events", get(events))
        .route("/status", get(status))
        .route("/stop", post(stop_all))
        .route("/wakeup", post(wakeup))
        .route("/profile", get(list_profiles).post(start_profile))
        .route("/profile/:id", get(profile_status).delete(stop_profile))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn ping() -> &'static str {
    "OK"
}

/// Upgrade to a WebSocket that streams every event to the caller
async fn events(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    let shutdown = state.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket| async move { gateway.subscribe(socket, shutdown).await })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.gateway.query().await)
}

/// Stop every profile, then start watching for an uninstall
async fn stop_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Stop all profiles");
    state.gateway.manager().stop_all().await;
    state.cleanup.schedule();
    (StatusCode::OK, Json(serde_json::Value::Null))
}

async fn wakeup(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let answered = state.gateway.wakeup().await;
    let code = if answered {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (code, Json(StatusResponse { status: answered }))
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.manager().snapshots().await)
}

async fn profile_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.gateway.manager().snapshot(&id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: Error::ProfileNotFound(id).to_string(),
            }),
        )
            .into_response(),
    }
}

/// Start a profile from the configuration in the request body
async fn start_profile(
    State(state): State<Arc<AppState>>,
    Json(profile): Json<ProfileConfig>,
) -> impl IntoResponse {
    info!("API: Start request for profile {}", profile.display_name());
    let id = profile.id.clone();

    match state.gateway.manager().start(profile).await {
        Ok(StartOutcome::Started(snapshot)) => (StatusCode::ACCEPTED, Json(snapshot)).into_response(),
        Ok(StartOutcome::AlreadyActive(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            error!("Failed to start profile {}: {}", id, e);
            let status = match e {
                Error::InvalidProfile(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

/// Stop a profile and return its final state
async fn stop_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("API: Stop request for profile {}", id);
    Json(state.gateway.manager().stop(&id).await)
}
