//! Probe logic and per-pool failure tracking.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint returned non-2xx.
    Unhealthy,
    /// Connection error or timeout.
    Failed,
}

/// Health of a pool as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for a single pool.
#[derive(Debug)]
pub struct HealthTracker {
    status: PoolHealth,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            status: PoolHealth::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health.
    pub fn record(&mut self, result: ProbeResult) -> PoolHealth {
        match result {
            ProbeResult::Healthy => {
                if self.status == PoolHealth::Unhealthy {
                    debug!(failures = self.consecutive_failures, "pool probe recovered");
                }
                self.consecutive_failures = 0;
                self.status = PoolHealth::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != PoolHealth::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "pool marked unhealthy"
                        );
                    }
                    self.status = PoolHealth::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> PoolHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Reachability check for a pool endpoint.
#[async_trait]
pub trait PoolProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

/// `GET http://{endpoint}{path}` with a timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub path: String,
    pub timeout: Duration,
}

#[async_trait]
impl PoolProbe for HttpProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        http_probe(endpoint, &self.path, self.timeout).await
    }
}

/// Perform an HTTP health probe against `address`.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "pool probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "pool probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "botshard-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "pool probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "pool probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "pool probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "pool probe timed out");
        ProbeResult::Failed
    })
}
