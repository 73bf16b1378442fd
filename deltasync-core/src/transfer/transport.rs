//! Request/response transports.
//!
//! A transport carries exactly one request and returns exactly one response.
//! Batching and framing belong to the protocol; retry and timeout policy
//! belong to the transport. Any error returned here is terminal for the
//! current push or pull.

use crate::server::Server;
use crate::transfer::messages::{Request, Response};
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        (**self).send(request).await
    }
}

/// Dispatches straight into an in-process [`Server`].
#[derive(Clone)]
pub struct LoopbackTransport {
    server: Server,
}

impl LoopbackTransport {
    pub fn new(server: Server) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        // round-trip through JSON so loopback exercises the wire format
        let encoded = serde_json::to_vec(&request)?;
        let decoded: Request = serde_json::from_slice(&encoded)?;
        let response = self.server.message_received(decoded).await?;
        let encoded = serde_json::to_vec(&response)?;
        Ok(serde_json::from_slice(&encoded)?)
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::SyncError;

    /// JSON over HTTP to a relay's `/api` endpoint.
    pub struct HttpTransport {
        client: reqwest::Client,
        api_url: String,
    }

    impl HttpTransport {
        /// `relay_url` is the relay base URL, e.g. `http://127.0.0.1:8743`.
        pub fn new(relay_url: &str) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            Ok(Self {
                client,
                api_url: format!("{}/api", relay_url.trim_end_matches('/')),
            })
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn send(&self, request: Request) -> Result<Response> {
            let resp = self
                .client
                .post(&self.api_url)
                .json(&request)
                .send()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
                return Err(SyncError::Transport(format!(
                    "Relay error {}: {}",
                    status, body
                )));
            }

            resp.json()
                .await
                .map_err(|e| SyncError::Transport(format!("Invalid relay response: {}", e)))
        }
    }
}
