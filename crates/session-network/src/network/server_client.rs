//! Onion-routed requests to HTTPS servers.
//!
//! Community and file servers sit behind the exit node instead of inside
//! the swarm, so their requests carry an HTTP shape (verb, endpoint,
//! headers) rather than an RPC method. Timestamped requests are rebuilt
//! through a caller-supplied factory on every attempt, so a clock resync
//! always produces a freshly signed request rather than replaying a stale
//! one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::session_network::SessionNetwork;
use crate::network::snode_client::backoff_delay;
use crate::onion::{OnionDestination, OnionResponse, OnionVersion};
use crate::snode::NetworkClock;

/// Outer retry attempts per server request.
const MAX_RETRY_ATTEMPTS: u32 = 4;

/// Something that can fetch authoritative network time.
///
/// [`SnodeClient`](crate::SnodeClient) implements this by asking a random
/// service node; it is a trait so server requests can be tested without a
/// swarm behind them.
#[async_trait]
pub trait NetworkTimeSource: Send + Sync {
    /// Fetch the current network time in epoch milliseconds and sync the
    /// shared clock to it.
    async fn sync_network_time(&self) -> Result<u64>;
}

/// One HTTP-shaped request to an onion-routed server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRequest {
    /// HTTP verb.
    pub method: String,
    /// Request path on the server.
    pub endpoint: String,
    /// Request headers, ordered for stable serialization.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ServerRequest {
    /// A bodyless request.
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Attach a raw body, encoded for the wire.
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = Some(BASE64.encode(body));
        self
    }

    /// Attach a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Client for onion-routed server requests with clock-aware retry.
pub struct ServerClient {
    network: Arc<SessionNetwork>,
    time: Arc<dyn NetworkTimeSource>,
    clock: Arc<NetworkClock>,
    version: OnionVersion,
}

impl ServerClient {
    /// Create a client over the shared dispatch stack.
    pub fn new(
        network: Arc<SessionNetwork>,
        time: Arc<dyn NetworkTimeSource>,
        clock: Arc<NetworkClock>,
    ) -> Self {
        Self {
            network,
            time,
            clock,
            version: OnionVersion::V4,
        }
    }

    /// Send a request built by `factory` for the current network time.
    ///
    /// `factory` is invoked once per attempt with a fresh timestamp, so
    /// request signatures never go stale across retries.
    pub async fn send<F>(
        &self,
        destination: &OnionDestination,
        factory: F,
    ) -> Result<OnionResponse>
    where
        F: Fn(u64) -> Result<ServerRequest>,
    {
        let mut attempt = 1;
        loop {
            if self.clock.needs_sync() {
                self.time.sync_network_time().await?;
            }
            let timestamp_ms = self.clock.now_ms().await;
            let request = factory(timestamp_ms)?;
            let payload = serde_json::to_vec(&request)?;

            match self
                .network
                .send_with_retry(destination, &payload, self.version, None)
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let recoverable =
                        error.is_retryable() || matches!(error, Error::ClockOutOfSync);
                    if !recoverable || attempt >= MAX_RETRY_ATTEMPTS {
                        return Err(error);
                    }
                    debug!("server request attempt {attempt} failed ({error})");
                    if !matches!(error, Error::ClockOutOfSync) {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
