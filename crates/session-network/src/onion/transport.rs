//! Onion transport: the single real network touchpoint.
//!
//! Given a path, a destination and a payload, the transport builds the
//! nested onion, POSTs it to the guard node and unwraps the response. It
//! detects and categorizes transport failure — retry policy belongs to the
//! orchestrators in [`crate::network`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::onion::encryption::{build_onion, open_response};
use crate::onion::{envelope, OnionDestination, OnionError, OnionPath, OnionResponse, OnionVersion};

/// Endpoint on the guard node accepting onion requests.
const ONION_REQUEST_ENDPOINT: &str = "/onion_req/v2";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Multi-hop dispatch of an encrypted payload.
#[async_trait]
pub trait OnionTransport: Send + Sync {
    /// Send `payload` to `destination` through `path`.
    ///
    /// A returned [`OnionResponse`] means every hop relayed successfully;
    /// the destination may still have answered with an error status.
    async fn send(
        &self,
        path: &OnionPath,
        destination: &OnionDestination,
        payload: &[u8],
        version: OnionVersion,
    ) -> std::result::Result<OnionResponse, OnionError>;
}

/// Production transport speaking HTTPS to the guard node.
///
/// Service nodes present self-signed certificates; transport security for
/// the request itself comes from the onion layers, so certificate
/// verification is disabled.
pub struct HttpsOnionTransport {
    client: reqwest::Client,
}

impl HttpsOnionTransport {
    /// Create a transport with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a transport with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OnionTransport for HttpsOnionTransport {
    async fn send(
        &self,
        path: &OnionPath,
        destination: &OnionDestination,
        payload: &[u8],
        version: OnionVersion,
    ) -> std::result::Result<OnionResponse, OnionError> {
        let built = build_onion(&path.nodes, destination, payload)
            .map_err(|e| OnionError::Unknown(e.to_string()))?;

        let guard = path.guard();
        let url = format!("{}{}", guard.https_url(), ONION_REQUEST_ENDPOINT);
        debug!(
            "dispatching onion request via guard {}",
            RedactedHex(guard.key())
        );

        let response = self
            .client
            .post(url)
            .body(built.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    OnionError::GuardUnreachable(e.to_string())
                } else {
                    OnionError::Unknown(e.to_string())
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OnionError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_hop_failure(status.as_u16(), &bytes));
        }

        let plaintext = open_response(&built.reply_key, &bytes)
            .map_err(|e| OnionError::InvalidResponse(e.to_string()))?;
        parse_unwrapped(&plaintext, version)
    }
}

/// Categorize a non-2xx answer from the guard: somewhere along the path a
/// hop refused to relay.
fn classify_hop_failure(status: u16, body: &[u8]) -> OnionError {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let failed = value
            .get("snode")
            .or_else(|| value.get("failed_snode"))
            .and_then(|v| v.as_str());
        if let Some(key) = failed {
            return OnionError::IntermediateNodeFailed {
                failed_key: Some(key.to_string()),
            };
        }
    }
    match status {
        502 | 503 | 504 => OnionError::IntermediateNodeFailed { failed_key: None },
        _ => OnionError::PathError(format!("guard returned {status}")),
    }
}

/// Parse the decrypted destination reply into an [`OnionResponse`].
fn parse_unwrapped(
    plaintext: &[u8],
    version: OnionVersion,
) -> std::result::Result<OnionResponse, OnionError> {
    let (code, body) = match version {
        OnionVersion::V3 => {
            let value: serde_json::Value = serde_json::from_slice(plaintext)
                .map_err(|e| OnionError::InvalidResponse(e.to_string()))?;
            let code = value
                .get("status_code")
                .or_else(|| value.get("status"))
                .and_then(|v| v.as_u64())
                .and_then(|code| u16::try_from(code).ok())
                .ok_or_else(|| OnionError::InvalidResponse("missing status code".into()))?;
            let body = match value.get("body") {
                Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
                Some(other) => other.to_string().into_bytes(),
                None => Vec::new(),
            };
            (code, body)
        }
        OnionVersion::V4 => {
            let decoded = envelope::decode(plaintext)
                .map_err(|e| OnionError::InvalidResponse(e.to_string()))?;
            let code = decoded
                .status()
                .ok_or_else(|| OnionError::InvalidResponse("missing status code".into()))?;
            (code, decoded.body.unwrap_or_default())
        }
    };

    if (200..300).contains(&code) {
        Ok(OnionResponse { status: None, body })
    } else {
        Ok(OnionResponse {
            status: Some(code),
            body,
        })
    }
}
