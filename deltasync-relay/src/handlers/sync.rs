//! Protocol dispatch and status handlers.

use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::State;
use axum::Json;
use deltasync_core::server::ServerStatus;
use deltasync_core::transfer::{Request, Response};

/// `POST /api`: hand one protocol message to the coordinator.
pub async fn api(
    State(state): State<AppState>,
    Json(req): Json<Request>,
) -> Result<Json<Response>, RelayError> {
    let is_push = matches!(req, Request::Push(_));
    let response = state.server.message_received(req).await.map_err(|e| {
        tracing::warn!("Rejected request: {}", e);
        RelayError::from(e)
    })?;

    if is_push && matches!(response, Response::Ok { .. }) {
        state.persist_current().await?;
    }
    tracing::debug!("Answered {}", response.kind());
    Ok(Json(response))
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.server.status().await)
}
