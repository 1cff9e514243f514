//! Micro-batching of snode sub-requests.
//!
//! Requests targeting the same (node, account, mode, version) within a
//! short window are coalesced into one wire call and the combined response
//! is demultiplexed back to the individual callers. A worker task exists
//! per active key and exits once its window closes; callers rendezvous
//! with it through a bounded queue and receive their slice of the batch
//! response over a oneshot channel. A caller that gives up simply drops
//! its receiving end; the batch proceeds without it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::onion::OnionVersion;
use crate::snode::ServiceNode;

/// How long a batch window stays open after its first request.
const BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Maximum sub-requests sent in one wire call.
const MAX_BATCH_SIZE: usize = 20;

/// Queued requests a single window will accept before refusing more.
const QUEUE_CAPACITY: usize = 64;

/// How the destination node executes a combined request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Sub-requests run independently; failures do not affect siblings.
    Batch,
    /// Sub-requests run in order and stop at the first failure.
    Sequence,
}

impl ExecutionMode {
    /// Wire method name of the combined request.
    pub fn method(self) -> &'static str {
        match self {
            ExecutionMode::Batch => "batch",
            ExecutionMode::Sequence => "sequence",
        }
    }
}

/// Coalescing key: only requests that agree on all four coordinates may
/// share a wire call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    /// Destination service node.
    pub node: ServiceNode,
    /// Account the sub-requests operate on.
    pub account: String,
    /// Combined execution mode.
    pub mode: ExecutionMode,
    /// Onion protocol version.
    pub version: OnionVersion,
}

/// A single RPC inside a combined request.
#[derive(Debug, Clone, Serialize)]
pub struct SubRequest {
    /// RPC method name.
    pub method: String,
    /// RPC parameters.
    pub params: Value,
}

/// A single result inside a combined response.
#[derive(Debug, Clone, Deserialize)]
pub struct SubResponse {
    /// Per-sub-request status code.
    pub code: u16,
    /// Per-sub-request body.
    #[serde(default)]
    pub body: Value,
}

impl SubResponse {
    /// Whether this sub-request succeeded.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Executes a combined request on the wire.
///
/// Implementations must return one response per request, in order; a
/// shorter vector fails the unanswered tail with
/// [`Error::ShortBatch`](crate::Error::ShortBatch).
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Execute `requests` as one combined call keyed by `key`.
    async fn execute(&self, key: &BatchKey, requests: Vec<SubRequest>) -> Result<Vec<SubResponse>>;
}

struct BatchItem {
    request: SubRequest,
    reply: oneshot::Sender<Result<SubResponse>>,
}

type WorkerMap = HashMap<BatchKey, mpsc::Sender<BatchItem>>;

/// Coalesces sub-requests into windows and demultiplexes the responses.
pub struct BatchDispatcher {
    executor: Arc<dyn BatchExecutor>,
    workers: Arc<Mutex<WorkerMap>>,
}

impl BatchDispatcher {
    /// Create a dispatcher over the given wire executor.
    pub fn new(executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            executor,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit one sub-request and await its individual result.
    pub async fn submit(&self, key: BatchKey, request: SubRequest) -> Result<SubResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = BatchItem {
            request,
            reply: reply_tx,
        };

        {
            let mut workers = self.workers.lock().await;
            let item = match workers.get(&key) {
                Some(sender) => match sender.try_send(item) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        return Err(Error::BatchQueueFull);
                    }
                    // Worker already closed its window; fall through and
                    // open a new one.
                    Err(mpsc::error::TrySendError::Closed(item)) => Some(item),
                },
                None => Some(item),
            };

            if let Some(item) = item {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                if tx.try_send(item).is_err() {
                    return Err(Error::Shutdown);
                }
                workers.insert(key.clone(), tx);
                let executor = Arc::clone(&self.executor);
                let map = Arc::clone(&self.workers);
                let worker_key = key.clone();
                tokio::spawn(async move {
                    run_window(executor, map, worker_key, rx).await;
                });
            }
        }

        reply_rx.await.map_err(|_| Error::Shutdown)?
    }
}

/// Collect one window's worth of requests, execute them, and fan the
/// results back out.
async fn run_window(
    executor: Arc<dyn BatchExecutor>,
    workers: Arc<Mutex<WorkerMap>>,
    key: BatchKey,
    mut rx: mpsc::Receiver<BatchItem>,
) {
    let deadline = Instant::now() + BATCH_WINDOW;
    let mut items: Vec<BatchItem> = Vec::new();

    while items.len() < MAX_BATCH_SIZE {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) | Err(_) => break,
        }
    }

    // Close the window: unregister under the map lock so no submit can
    // enqueue between removal and the final drain, then pick up whatever
    // raced in while we were collecting.
    {
        let mut workers = workers.lock().await;
        workers.remove(&key);
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
    }
    rx.close();

    if items.is_empty() {
        return;
    }
    debug!(
        "dispatching {} sub-request(s) as {}",
        items.len(),
        key.mode.method()
    );

    // The drain above can push the window past the wire cap; execute in
    // capped chunks so every caller is still answered.
    for chunk in into_chunks(items, MAX_BATCH_SIZE) {
        execute_chunk(&*executor, &key, chunk).await;
    }
}

async fn execute_chunk(executor: &dyn BatchExecutor, key: &BatchKey, chunk: Vec<BatchItem>) {
    let requests: Vec<SubRequest> = chunk.iter().map(|item| item.request.clone()).collect();
    match executor.execute(key, requests).await {
        Ok(responses) => {
            let mut responses = responses.into_iter();
            for item in chunk {
                let result = responses.next().ok_or(Error::ShortBatch);
                // A dropped receiver means the caller went away; the rest
                // of the batch is unaffected.
                let _ = item.reply.send(result);
            }
        }
        Err(error) => {
            warn!("combined request failed: {error}");
            for item in chunk {
                let _ = item.reply.send(Err(error.clone()));
            }
        }
    }
}

/// Split a vector into owned chunks of at most `size` items.
fn into_chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    while items.len() > size {
        let tail = items.split_off(size);
        chunks.push(std::mem::replace(&mut items, tail));
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}
