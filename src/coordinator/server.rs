//! Local HTTP surface for the out-of-process agent.
//!
//! The agent polls `/auth/pending` for captured OAuth URLs and posts codes
//! back to `/auth/complete`. Everything is JSON over loopback; there is no
//! auth on this surface beyond the loopback bind.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use super::{AuthResponse, PaneCoordinator};
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    coordinator: Arc<PaneCoordinator>,
}

pub fn router(coordinator: Arc<PaneCoordinator>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/auth/pending", get(handle_auth_pending))
        .route("/auth/complete", post(handle_auth_complete))
        .route("/auth/submit", post(handle_auth_complete))
        .route("/panes", get(handle_panes))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(AppState { coordinator })
}

/// Bind the API on loopback and serve until the task is dropped.
pub async fn serve(coordinator: Arc<PaneCoordinator>, port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::io(format!("binding {addr}"), e))?;
    tracing::info!(addr = addr.as_str(), "Coordinator API listening");
    axum::serve(listener, router(coordinator))
        .await
        .map_err(|e| Error::io("serving coordinator API", e))
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "backend": state.coordinator.backend(),
    }))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.status().await)
}

async fn handle_auth_pending(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.pending_requests().await)
}

async fn handle_auth_complete(
    State(state): State<AppState>,
    Json(response): Json<AuthResponse>,
) -> impl IntoResponse {
    if response.request_id.is_empty() || (response.code.is_empty() && response.error.is_none()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "request_id and code (or error) are required"})),
        )
            .into_response();
    }

    match state.coordinator.receive_auth_response(response).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(Error::NotFound(what)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": what})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn handle_panes(State(state): State<AppState>) -> impl IntoResponse {
    match state.coordinator.list_panes().await {
        Ok(panes) => Json(panes).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
