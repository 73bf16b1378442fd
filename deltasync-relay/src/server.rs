//! Axum router setup.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::handlers::sync;
use crate::storage::RelayStorage;
use axum::routing::{get, post};
use axum::Router;
use deltasync_core::{Server, SignedVerhash};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub server: Server,
    pub storage: RelayStorage,
    /// Pointer of the last version written to storage
    persisted: Arc<Mutex<Option<SignedVerhash>>>,
}

impl AppState {
    pub fn new(server: Server, storage: RelayStorage) -> Self {
        Self {
            server,
            storage,
            persisted: Arc::new(Mutex::new(None)),
        }
    }

    /// Write the coordinator's current version to storage if it moved.
    ///
    /// The lock is held while reading the current version, so the last
    /// writer always stores the newest install.
    pub async fn persist_current(&self) -> Result<(), RelayError> {
        let mut persisted = self.persisted.lock().await;
        let Some(current) = self.server.current().await else {
            return Ok(());
        };
        if persisted.as_ref() == Some(current.signed_verhash()) {
            return Ok(());
        }
        self.storage.save_version(&current)?;
        *persisted = Some(current.signed_verhash().clone());
        Ok(())
    }
}

pub fn build_router(state: AppState, config: &RelayConfig) -> Router {
    Router::new()
        .route("/api", post(sync::api))
        .route("/api/status", get(sync::status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use deltasync_core::transfer::{Cursor, PushRequest, Request};
    use deltasync_core::{Keyring, KvMap, Version, VersionStore};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = AppState::new(Server::default(), RelayStorage::in_memory().unwrap());
        (build_router(state.clone(), &RelayConfig::default()), state)
    }

    fn version(store: &VersionStore, entries: &[(&str, &str)]) -> Arc<Version> {
        let mut nv = store.create_first_version();
        let kvs: KvMap = entries
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        nv.set_all_kvs(&kvs).unwrap();
        nv.close().unwrap()
    }

    fn single_batch_push(to: &Version, content: &Version) -> Request {
        Request::Push(PushRequest {
            from: None,
            to: to.signed_verhash().unwrap(),
            first: Cursor::Start,
            upto: Cursor::End,
            batch: content.create_delta_from(None),
        })
    }

    async fn post_api(router: Router, request: &Request) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                HttpRequest::post("/api")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (router, _) = app();
        let response = router
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn push_installs_and_persists() {
        let (router, state) = app();
        let store = VersionStore::new(Keyring::from_secret(b"relay test").unwrap());
        let v1 = version(&store, &[("a", "1"), ("b", "2")]);

        let (status, body) = post_api(router.clone(), &single_batch_push(&v1, &v1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"type": "ok"}));

        let stored = state.storage.load_version().unwrap().unwrap();
        assert_eq!(stored.pointer, v1.signed_verhash().unwrap());
        assert_eq!(stored.kevs.len(), 2);

        let response = router
            .oneshot(HttpRequest::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["seqnum"], json!(1));
        assert_eq!(status["entries"], json!(2));
        assert_eq!(status["pending_pushes"], json!(0));
    }

    #[tokio::test]
    async fn stale_push_is_out_of_date() {
        let (router, _) = app();
        let store = VersionStore::new(Keyring::from_secret(b"relay test").unwrap());
        let v1 = version(&store, &[("a", "1")]);
        post_api(router.clone(), &single_batch_push(&v1, &v1)).await;

        let other = version(&store, &[("a", "2")]);
        let (status, body) = post_api(router, &single_batch_push(&other, &other)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], json!("out-of-date"));
        assert_eq!(
            body["serverVersion"],
            json!(v1.signed_verhash().unwrap().as_str())
        );
    }

    #[tokio::test]
    async fn mismatched_content_is_unprocessable() {
        let (router, state) = app();
        let store = VersionStore::new(Keyring::from_secret(b"relay test").unwrap());
        let claimed = version(&store, &[("a", "1")]);
        let sent = version(&store, &[("a", "evil")]);

        let (status, body) = post_api(router, &single_batch_push(&claimed, &sent)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());
        assert!(state.server.current().await.is_none());
        assert!(state.storage.load_version().unwrap().is_none());
    }

    #[tokio::test]
    async fn pull_from_empty_relay() {
        let (router, _) = app();
        let request = Request::Pull(deltasync_core::transfer::PullRequest {
            from: None,
            to: SignedVerhash::from("1:abc:def"),
            first: Cursor::Start,
        });
        let (status, body) = post_api(router, &request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"type": "unknown-delta", "serverVersion": null}));
    }
}
