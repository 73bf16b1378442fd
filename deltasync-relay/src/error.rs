//! Relay error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use deltasync_core::SyncError;

/// Relay server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum RelayError {
    Database(String),
    BadRequest(String),
    Protocol(String),
    Integrity(String),
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Integrity(e) => write!(f, "Integrity error: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Self::BadRequest(e) | Self::Protocol(e) => (StatusCode::BAD_REQUEST, e.clone()),
            Self::Integrity(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.clone()),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<SyncError> for RelayError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Integrity(_) | SyncError::CorruptRecord(_) => Self::Integrity(e.to_string()),
            SyncError::Protocol(_) | SyncError::Crypto(_) => Self::Protocol(e.to_string()),
            SyncError::Serialization(_) | SyncError::Config(_) => Self::BadRequest(e.to_string()),
            SyncError::Transport(_) | SyncError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_maps_to_422() {
        let err = RelayError::from(SyncError::Integrity("hash mismatch".to_string()));
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn protocol_maps_to_400() {
        let err = RelayError::from(SyncError::Protocol("bad pointer".to_string()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
