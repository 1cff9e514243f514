//! Typed service-node operations.
//!
//! [`SnodeClient`] is the account-facing surface for swarm storage: store,
//! retrieve, delete and expiry operations plus swarm and network-time
//! lookups. It wires the full dispatch stack together (path manager,
//! failure classifier, path-level retry, micro-batching) and adds the
//! outer retry loop: bounded attempts with exponential backoff and jitter,
//! rebuilding signed parameters with a fresh timestamp after a clock
//! resync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::auth::{
    apply_signature, delete_all_message, delete_message, expire_message, timestamped_message,
    SwarmAuth, TtlChange,
};
use crate::network::batch::{
    BatchDispatcher, BatchExecutor, BatchKey, ExecutionMode, SubRequest, SubResponse,
};
use crate::network::classify::{Decision, FailureHandler};
use crate::network::ons;
use crate::network::server_client::NetworkTimeSource;
use crate::network::session_network::SessionNetwork;
use crate::onion::{OnionDestination, OnionTransport, OnionVersion, PathManager};
use crate::snode::{NetworkClock, ServiceNode, SnodePool, SwarmDirectory};

/// Outer retry attempts per operation.
const MAX_RETRY_ATTEMPTS: u32 = 4;

/// Backoff for the first retry.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling for the exponential backoff.
const BACKOFF_CAP: Duration = Duration::from_millis(3200);

/// Confirmation returned by a successful store.
#[derive(Debug, Clone)]
pub struct StoreResult {
    /// Server-assigned message hash.
    pub hash: String,
    /// Expiry the swarm recorded, in network milliseconds.
    pub expiry_ms: Option<u64>,
}

/// One message pulled from a swarm namespace.
#[derive(Debug, Clone)]
pub struct RetrievedMessage {
    /// Server-assigned message hash.
    pub hash: String,
    /// Decoded message payload.
    pub data: Vec<u8>,
    /// Stored-at time in network milliseconds.
    pub timestamp_ms: Option<u64>,
    /// Expiry in network milliseconds.
    pub expiry_ms: Option<u64>,
}

/// Client for swarm storage RPCs over onion routing.
pub struct SnodeClient {
    pool: Arc<SnodePool>,
    swarms: Arc<SwarmDirectory>,
    clock: Arc<NetworkClock>,
    handler: Arc<FailureHandler>,
    batcher: BatchDispatcher,
    version: OnionVersion,
}

impl SnodeClient {
    /// Wire up the full dispatch stack over the shared directories and the
    /// given transport.
    pub fn new(
        pool: Arc<SnodePool>,
        swarms: Arc<SwarmDirectory>,
        clock: Arc<NetworkClock>,
        transport: Arc<dyn OnionTransport>,
    ) -> Self {
        let paths = Arc::new(PathManager::new(Arc::clone(&pool), Arc::clone(&swarms)));
        let handler = Arc::new(FailureHandler::new(
            Arc::clone(&paths),
            Arc::clone(&swarms),
            Arc::clone(&clock),
        ));
        let network = Arc::new(SessionNetwork::new(
            paths,
            transport,
            Arc::clone(&handler),
        ));
        let batcher = BatchDispatcher::new(Arc::new(BatchRpcExecutor { network }));
        Self {
            pool,
            swarms,
            clock,
            handler,
            batcher,
            version: OnionVersion::V4,
        }
    }

    /// The underlying node pool.
    pub(crate) fn pool(&self) -> &SnodePool {
        &self.pool
    }

    /// Store a message in the account's swarm.
    pub async fn send_message(
        &self,
        auth: &dyn SwarmAuth,
        namespace: i32,
        data: &[u8],
        ttl_ms: u64,
    ) -> Result<StoreResult> {
        let data = BASE64.encode(data);
        let body = self
            .call_signed(auth, move |timestamp_ms| {
                let mut params = Map::new();
                params.insert("data".into(), Value::String(data.clone()));
                params.insert("ttl".into(), Value::from(ttl_ms));
                params.insert("timestamp".into(), Value::from(timestamp_ms));
                Ok((
                    "store",
                    params,
                    timestamped_message("store", namespace, timestamp_ms),
                    namespace,
                ))
            })
            .await?;

        let hash = body
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidResponse("store response missing hash".into()))?
            .to_string();
        info!("stored message in namespace {namespace}");
        Ok(StoreResult {
            hash,
            expiry_ms: body.get("expiry").and_then(Value::as_u64),
        })
    }

    /// Retrieve messages from a namespace, newest first from `last_hash`.
    pub async fn retrieve_messages(
        &self,
        auth: &dyn SwarmAuth,
        namespace: i32,
        last_hash: Option<&str>,
    ) -> Result<Vec<RetrievedMessage>> {
        let last_hash = last_hash.map(str::to_string);
        let body = self
            .call_signed(auth, move |timestamp_ms| {
                let mut params = Map::new();
                if let Some(hash) = &last_hash {
                    params.insert("last_hash".into(), Value::String(hash.clone()));
                }
                Ok((
                    "retrieve",
                    params,
                    timestamped_message("retrieve", namespace, timestamp_ms),
                    namespace,
                ))
            })
            .await?;

        let raw = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvalidResponse("retrieve response missing messages".into()))?;
        let mut messages = Vec::with_capacity(raw.len());
        for entry in raw {
            let hash = entry
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidResponse("message missing hash".into()))?
                .to_string();
            let data = entry
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidResponse("message missing data".into()))?;
            let data = BASE64
                .decode(data)
                .map_err(|e| Error::Encoding(e.to_string()))?;
            messages.push(RetrievedMessage {
                hash,
                data,
                timestamp_ms: entry.get("timestamp").and_then(Value::as_u64),
                expiry_ms: entry.get("expiration").and_then(Value::as_u64),
            });
        }
        debug!("retrieved {} message(s)", messages.len());
        Ok(messages)
    }

    /// Delete specific messages by hash.
    pub async fn delete_messages(&self, auth: &dyn SwarmAuth, hashes: &[String]) -> Result<Value> {
        let hashes = hashes.to_vec();
        self.call_signed(auth, move |_timestamp_ms| {
            let mut params = Map::new();
            params.insert("messages".into(), Value::from(hashes.clone()));
            Ok(("delete", params, delete_message(&hashes), 0))
        })
        .await
    }

    /// Delete every message in a namespace.
    pub async fn delete_all_messages(&self, auth: &dyn SwarmAuth, namespace: i32) -> Result<Value> {
        self.call_signed(auth, move |timestamp_ms| {
            Ok((
                "delete_all",
                Map::new(),
                delete_all_message(namespace, timestamp_ms),
                namespace,
            ))
        })
        .await
    }

    /// Shorten or extend the expiry of stored messages.
    pub async fn alter_ttl(
        &self,
        auth: &dyn SwarmAuth,
        change: TtlChange,
        expiry_ms: u64,
        hashes: &[String],
    ) -> Result<Value> {
        let hashes = hashes.to_vec();
        self.call_signed(auth, move |_timestamp_ms| {
            let mut params = Map::new();
            params.insert("messages".into(), Value::from(hashes.clone()));
            params.insert("expiry".into(), Value::from(expiry_ms));
            params.insert(change.flag().into(), Value::Bool(true));
            Ok(("expire", params, expire_message(change, expiry_ms, &hashes), 0))
        })
        .await
    }

    /// The swarm responsible for an account, fetching it on first use.
    pub async fn swarm_for(&self, account_id: &str) -> Result<Vec<ServiceNode>> {
        if let Some(nodes) = self.swarms.cached(account_id).await {
            return Ok(nodes);
        }

        let node = self.pool.get_random_snode().await?;
        let response = self
            .invoke(
                node,
                account_id,
                "get_swarm",
                json!({ "pubkey": account_id }),
            )
            .await?;
        let body = serde_json::to_vec(&response.body)?;
        if !self.swarms.update_from_response(account_id, &body).await {
            return Err(Error::SwarmFetch("swarm response had no usable nodes".into()));
        }
        self.swarms
            .cached(account_id)
            .await
            .ok_or_else(|| Error::SwarmFetch("swarm cache rejected fetched nodes".into()))
    }

    /// Ask a random pool node for the network time and sync the clock.
    pub async fn get_network_time(&self) -> Result<u64> {
        let node = self.pool.get_random_snode().await?;
        let response = self.invoke(node, "", "info", json!({})).await?;
        let timestamp = response
            .body
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::InvalidResponse("info response missing timestamp".into()))?;
        self.clock.update(timestamp).await;
        debug!("network clock synced");
        Ok(timestamp)
    }

    /// Resolve a human-readable name to an account id.
    pub async fn get_account_id(&self, name: &str) -> Result<String> {
        ons::resolve(self, name).await
    }

    /// Dispatch a raw RPC to a specific node through the batching stage.
    pub async fn invoke(
        &self,
        node: ServiceNode,
        account: &str,
        method: &str,
        params: Value,
    ) -> Result<SubResponse> {
        let key = BatchKey {
            node,
            account: account.to_string(),
            mode: ExecutionMode::Batch,
            version: self.version,
        };
        let request = SubRequest {
            method: method.to_string(),
            params,
        };

        let mut attempt = 1;
        loop {
            let result = self.batcher.submit(key.clone(), request.clone()).await;
            match self.settle(&key, result).await {
                Ok(response) => return Ok(response),
                Err(Verdict::Fatal(error)) => return Err(error),
                Err(Verdict::Retry(error)) => self.backoff(error, &mut attempt).await?,
            }
        }
    }

    /// Build, sign and dispatch an account-scoped RPC, rebuilding the
    /// signature with a fresh timestamp on every attempt.
    ///
    /// `build` returns the method name, unsigned params, canonical message
    /// bytes and namespace for the given timestamp.
    async fn call_signed<F>(&self, auth: &dyn SwarmAuth, build: F) -> Result<Value>
    where
        F: Fn(u64) -> Result<(&'static str, Map<String, Value>, Vec<u8>, i32)>,
    {
        let account = auth.account_id().to_string();
        let mut attempt = 1;
        loop {
            if self.clock.needs_sync() {
                self.get_network_time().await?;
            }
            let timestamp_ms = self.clock.now_ms().await;
            let (method, mut params, message, namespace) = build(timestamp_ms)?;
            apply_signature(&mut params, auth, namespace, timestamp_ms, &message)?;

            let swarm = self.swarm_for(&account).await?;
            let node = swarm
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| Error::SwarmFetch("swarm is empty".into()))?;

            let key = BatchKey {
                node,
                account: account.clone(),
                mode: ExecutionMode::Batch,
                version: self.version,
            };
            let request = SubRequest {
                method: method.to_string(),
                params: Value::Object(params),
            };

            let result = self.batcher.submit(key.clone(), request).await;
            match self.settle(&key, result).await {
                Ok(response) => return Ok(response.body),
                Err(Verdict::Fatal(error)) => return Err(error),
                Err(Verdict::Retry(error)) => self.backoff(error, &mut attempt).await?,
            }
        }
    }

    /// Turn a sub-response into a terminal result or a retry verdict,
    /// running non-2xx codes through the failure classifier so they repair
    /// state the same way destination-level failures do.
    async fn settle(
        &self,
        key: &BatchKey,
        result: Result<SubResponse>,
    ) -> std::result::Result<SubResponse, Verdict> {
        let response = match result {
            Ok(response) => response,
            Err(error) if error.is_retryable() => return Err(Verdict::Retry(error)),
            // The classifier already flagged the clock; the next loop
            // iteration resyncs before rebuilding the request.
            Err(Error::ClockOutOfSync) => return Err(Verdict::Retry(Error::ClockOutOfSync)),
            Err(error) => return Err(Verdict::Fatal(error)),
        };
        if response.is_success() {
            return Ok(response);
        }

        let destination = OnionDestination::Snode(key.node.clone());
        let body = serde_json::to_vec(&response.body).unwrap_or_default();
        let account = if key.account.is_empty() {
            None
        } else {
            Some(key.account.as_str())
        };
        let error = Error::Destination {
            status: response.code,
            body: Some(String::from_utf8_lossy(&body).into_owned()),
        };
        match self
            .handler
            .on_destination_status(&destination, response.code, &body, account)
            .await
        {
            Decision::Retry { .. } => Err(Verdict::Retry(error)),
            Decision::RetryAfterClockSync => Err(Verdict::Retry(Error::ClockOutOfSync)),
            Decision::Fail(error) => Err(Verdict::Fatal(error)),
        }
    }

    /// Sleep out the backoff, or surface the carried error once the
    /// attempt budget is spent.
    async fn backoff(&self, error: Error, attempt: &mut u32) -> Result<()> {
        if *attempt >= MAX_RETRY_ATTEMPTS {
            return Err(error);
        }
        debug!("attempt {attempt} failed ({error}), backing off");
        tokio::time::sleep(backoff_delay(*attempt)).await;
        *attempt += 1;
        Ok(())
    }
}

/// Outcome of one dispatch attempt.
enum Verdict {
    /// Recoverable; retry after backoff. Carries the error to surface when
    /// the attempt budget runs out.
    Retry(Error),
    /// Terminal; stop retrying.
    Fatal(Error),
}

#[async_trait]
impl NetworkTimeSource for SnodeClient {
    async fn sync_network_time(&self) -> Result<u64> {
        self.get_network_time().await
    }
}

/// Exponential backoff with jitter: doubles from the base, capped, plus a
/// random share of up to a third of the delay.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = BACKOFF_CAP.min(BACKOFF_BASE * (1 << exponent));
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=delay / 3);
    delay + jitter
}

/// Wire executor behind the batching stage: wraps a window's sub-requests
/// into one combined RPC, dispatches it through the path-level retry loop
/// and splits the results back out.
struct BatchRpcExecutor {
    network: Arc<SessionNetwork>,
}

#[async_trait]
impl BatchExecutor for BatchRpcExecutor {
    async fn execute(&self, key: &BatchKey, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>> {
        let swarm_pubkey = if key.account.is_empty() {
            None
        } else {
            Some(key.account.as_str())
        };
        let destination = OnionDestination::Snode(key.node.clone());

        // A lone request skips the combined wrapper.
        if requests.len() == 1 {
            let payload = serde_json::to_vec(&requests[0])?;
            let response = self
                .network
                .send_with_retry(&destination, &payload, key.version, swarm_pubkey)
                .await?;
            let body = serde_json::from_slice(&response.body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into()));
            return Ok(vec![SubResponse { code: 200, body }]);
        }

        let payload = serde_json::to_vec(&json!({
            "method": key.mode.method(),
            "params": { "requests": requests },
        }))?;
        let response = self
            .network
            .send_with_retry(&destination, &payload, key.version, swarm_pubkey)
            .await?;

        let body: Value = serde_json::from_slice(&response.body)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvalidResponse("combined response missing results".into()))?;
        results
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.clone())
                    .map_err(|e| Error::InvalidResponse(e.to_string()))
            })
            .collect()
    }
}
