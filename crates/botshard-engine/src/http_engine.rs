//! HTTP/1.1 JSON client for a remote simulation engine.
//!
//! | Method | Path | Body / response |
//! |---|---|---|
//! | POST | `/shards/{shard}/commands` | `CommandSubmission` → `{"commandRef": …}` |
//! | GET | `/commands/{ref}` | `CommandResult`, or 204 while pending |
//! | GET | `/shards/{shard}/state` | `EngineState` |
//! | PUT | `/shards/{shard}/next-seq` | `{"nextSeq": n}` |
//! | POST | `/shards/{shard}/start` | empty |
//! | POST | `/shards/{shard}/kick` | `{"maxDurationMs": n}` |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::*;
use crate::SimulationEngine;

/// Client for an engine reachable at `host:port`.
#[derive(Debug, Clone)]
pub struct HttpEngine {
    address: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    command_ref: String,
}

impl HttpEngine {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and return `(status, body)`.
    async fn send(
        &self,
        method: http::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<(http::StatusCode, Bytes)> {
        let uri = format!("http://{}{path}", self.address);
        let payload = match body {
            Some(value) => {
                let bytes =
                    serde_json::to_vec(&value).map_err(|e| EngineError::Decode(e.to_string()))?;
                Bytes::from(bytes)
            }
            None => Bytes::new(),
        };

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.address)
                .header("content-type", "application/json")
                .header("user-agent", "botshard-engine/0.1")
                .body(Full::new(payload))
                .map_err(|e| EngineError::Transport(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, EngineError>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => {
                if let Ok((status, _)) = &result {
                    debug!(%uri, %status, "engine request");
                }
                result
            }
            Err(_) => {
                debug!(%uri, "engine request timed out");
                Err(EngineError::Timeout)
            }
        }
    }

    /// Send a request that must succeed with 2xx; decode the body as `T`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: http::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<T> {
        let (status, bytes) = self.send(method, path, body).await?;
        ensure_success(status, &bytes)?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))
    }

    /// Send a request that must succeed with 2xx; ignore the body.
    async fn call_unit(
        &self,
        method: http::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        let (status, bytes) = self.send(method, path, body).await?;
        ensure_success(status, &bytes)
    }
}

fn ensure_success(status: http::StatusCode, body: &Bytes) -> EngineResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(EngineError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

#[async_trait]
impl SimulationEngine for HttpEngine {
    async fn submit_command(&self, command: CommandSubmission) -> EngineResult<CommandRef> {
        let path = format!("/shards/{}/commands", command.shard_id);
        let body = serde_json::to_value(&command).map_err(|e| EngineError::Decode(e.to_string()))?;
        let resp: SubmitResponse = self.call(http::Method::POST, &path, Some(body)).await?;
        Ok(resp.command_ref)
    }

    async fn command_result(&self, reference: &str) -> EngineResult<Option<CommandResult>> {
        let path = format!("/commands/{reference}");
        let (status, bytes) = self.send(http::Method::GET, &path, None).await?;
        if status == http::StatusCode::NO_CONTENT || status == http::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure_success(status, &bytes)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    async fn engine_state(&self, shard_id: &str) -> EngineResult<EngineState> {
        let path = format!("/shards/{shard_id}/state");
        self.call(http::Method::GET, &path, None).await
    }

    async fn advance_next_seq(&self, shard_id: &str, next_seq: u64) -> EngineResult<()> {
        let path = format!("/shards/{shard_id}/next-seq");
        self.call_unit(
            http::Method::PUT,
            &path,
            Some(serde_json::json!({ "nextSeq": next_seq })),
        )
        .await
    }

    async fn start(&self, shard_id: &str) -> EngineResult<()> {
        let path = format!("/shards/{shard_id}/start");
        self.call_unit(http::Method::POST, &path, None).await
    }

    async fn kick(&self, shard_id: &str, max_duration_ms: u64) -> EngineResult<()> {
        let path = format!("/shards/{shard_id}/kick");
        self.call_unit(
            http::Method::POST,
            &path,
            Some(serde_json::json!({ "maxDurationMs": max_duration_ms })),
        )
        .await
    }
}
