//! Failure classification.
//!
//! Classifiers map (error, context) to a [`Decision`] and apply the
//! corresponding side effects to the directories: penalize a path or node,
//! refresh swarm membership, or flag the clock for resync. They never
//! return errors themselves — only the orchestrators surface terminal
//! failures.
//!
//! Destination statuses encode application semantics (auth failure, clock
//! skew, stale swarm) that need corrective action before a retry is
//! useful; path-level transport failures mean the route itself is
//! unreliable and should be abandoned rather than retried identically.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Error;
use crate::logging::RedactedHex;
use crate::onion::{OnionDestination, OnionError, OnionPath, PathManager};
use crate::snode::{NetworkClock, SwarmDirectory};

/// Body substring marking a 502 that should force-evict the destination.
const UNPARSABLE_BODY_MARKER: &str = "unparsable data";

/// Body substring marking a 503 from a node that is still warming up.
const NOT_READY_BODY_MARKER: &str = "not ready";

/// Consecutive clock-skew errors tolerated before evicting a destination.
const MAX_CONSECUTIVE_SKEW: u32 = 2;

/// What an orchestrator should do after a classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Retry with a fresh path, excluding a node when one is named.
    Retry {
        /// Node the next path must not contain.
        exclude_node: Option<String>,
    },
    /// Resync the network clock, rebuild the request, then retry.
    RetryAfterClockSync,
    /// Stop retrying and surface the mapped error.
    Fail(Error),
}

/// Shared classifier over the directories.
///
/// Classification of a fixed (error, context) pair is deterministic; the
/// only randomness in the system lives in path and node selection.
pub struct FailureHandler {
    paths: Arc<PathManager>,
    swarms: Arc<SwarmDirectory>,
    clock: Arc<NetworkClock>,
    /// Consecutive clock-skew failures per destination id.
    skew_counts: RwLock<HashMap<String, u32>>,
}

impl FailureHandler {
    /// Create a handler over the shared services.
    pub fn new(
        paths: Arc<PathManager>,
        swarms: Arc<SwarmDirectory>,
        clock: Arc<NetworkClock>,
    ) -> Self {
        Self {
            paths,
            swarms,
            clock,
            skew_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Record an end-to-end success for a destination.
    pub async fn on_success(&self, destination: &OnionDestination) {
        self.skew_counts.write().await.remove(&destination.id());
    }

    /// Classify a transport-level failure observed on `path`.
    pub async fn on_transport_failure(&self, error: &OnionError, path: &OnionPath) -> Decision {
        match error {
            OnionError::IntermediateNodeFailed {
                failed_key: Some(key),
            } => {
                // The broken hop is identifiable: evict it outright and
                // penalize the route that carried it.
                self.paths.handle_bad_snode(key, None, true).await;
                self.paths.handle_bad_path(path.id).await;
                Decision::Retry {
                    exclude_node: Some(key.clone()),
                }
            }
            OnionError::IntermediateNodeFailed { failed_key: None }
            | OnionError::PathError(_)
            | OnionError::GuardUnreachable(_)
            | OnionError::InvalidResponse(_)
            | OnionError::Unknown(_) => {
                self.paths.handle_bad_path(path.id).await;
                Decision::Retry { exclude_node: None }
            }
            OnionError::DestinationError { status, body } => {
                // The path worked; hand over to destination classification
                // without a destination context (no swarm to repair).
                debug!("transport surfaced destination error {status}");
                Decision::Fail(Error::Destination {
                    status: *status,
                    body: body.clone(),
                })
            }
        }
    }

    /// Classify an error status answered by the destination itself.
    ///
    /// `swarm_pubkey` is the account whose swarm the request targeted, for
    /// membership repair on 421.
    pub async fn on_destination_status(
        &self,
        destination: &OnionDestination,
        status: u16,
        body: &[u8],
        swarm_pubkey: Option<&str>,
    ) -> Decision {
        match (status, destination) {
            (400 | 403 | 404, _) => Decision::Fail(destination_error(status, body)),

            // Clock out of sync with a snode destination.
            (406, OnionDestination::Snode(node)) => {
                self.clock.mark_stale();
                if self.bump_skew(&destination.id()).await >= MAX_CONSECUTIVE_SKEW {
                    warn!(
                        "repeated clock skew from {}, evicting",
                        RedactedHex(node.key())
                    );
                    self.reset_skew(&destination.id()).await;
                    self.paths
                        .handle_bad_snode(node.key(), swarm_pubkey, true)
                        .await;
                    Decision::Retry { exclude_node: None }
                } else {
                    Decision::RetryAfterClockSync
                }
            }

            // Clock out of sync with a server destination: same pattern,
            // but there is no node to evict, so the second consecutive
            // occurrence fails outright.
            (425, OnionDestination::Server { .. }) => {
                self.clock.mark_stale();
                if self.bump_skew(&destination.id()).await >= MAX_CONSECUTIVE_SKEW {
                    self.reset_skew(&destination.id()).await;
                    Decision::Fail(destination_error(status, body))
                } else {
                    Decision::RetryAfterClockSync
                }
            }

            // Swarm membership is stale: prefer the destination's
            // self-reported member list, fall back to dropping the one
            // node that misdirected us. Never surfaced to the caller.
            (421, OnionDestination::Snode(node)) => {
                if let Some(pubkey) = swarm_pubkey {
                    let updated = self.swarms.update_from_response(pubkey, body).await;
                    if !updated {
                        self.swarms.drop_member(node.key(), pubkey).await;
                    }
                } else {
                    debug!("421 without swarm context, retrying blind");
                }
                Decision::Retry {
                    exclude_node: None,
                }
            }

            (502, OnionDestination::Snode(node)) if body_contains(body, UNPARSABLE_BODY_MARKER) => {
                self.paths
                    .handle_bad_snode(node.key(), swarm_pubkey, true)
                    .await;
                Decision::Retry { exclude_node: None }
            }

            (503, OnionDestination::Snode(node)) if body_contains(body, NOT_READY_BODY_MARKER) => {
                self.paths
                    .handle_bad_snode(node.key(), swarm_pubkey, false)
                    .await;
                Decision::Retry { exclude_node: None }
            }

            // Any other destination-level error is application semantics:
            // fail verbatim, no penalty.
            _ => Decision::Fail(destination_error(status, body)),
        }
    }

    async fn bump_skew(&self, destination_id: &str) -> u32 {
        let mut counts = self.skew_counts.write().await;
        let count = counts.entry(destination_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    async fn reset_skew(&self, destination_id: &str) {
        self.skew_counts.write().await.remove(destination_id);
    }
}

fn destination_error(status: u16, body: &[u8]) -> Error {
    let body = if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    };
    Error::Destination { status, body }
}

fn body_contains(body: &[u8], marker: &str) -> bool {
    String::from_utf8_lossy(body).contains(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snode::test_support::test_node;
    use crate::snode::{ServiceNode, SnodePool, StaticSeed};

    struct Fixture {
        pool: Arc<SnodePool>,
        swarms: Arc<SwarmDirectory>,
        clock: Arc<NetworkClock>,
        paths: Arc<PathManager>,
        handler: FailureHandler,
    }

    async fn fixture(nodes: Vec<ServiceNode>) -> Fixture {
        let pool = Arc::new(SnodePool::new(Arc::new(StaticSeed(nodes))));
        pool.refresh_from_seed().await.expect("seed");
        let swarms = Arc::new(SwarmDirectory::new());
        let clock = Arc::new(NetworkClock::new());
        let paths = Arc::new(PathManager::new(Arc::clone(&pool), Arc::clone(&swarms)));
        let handler = FailureHandler::new(
            Arc::clone(&paths),
            Arc::clone(&swarms),
            Arc::clone(&clock),
        );
        Fixture {
            pool,
            swarms,
            clock,
            paths,
            handler,
        }
    }

    fn snode_destination(id: u8) -> OnionDestination {
        OnionDestination::Snode(test_node(id))
    }

    fn server_destination() -> OnionDestination {
        OnionDestination::Server {
            host: "open.example.org".into(),
            port: 443,
            scheme: "https".into(),
            x25519_pubkey: hex::encode([9u8; 32]),
            target: "/".into(),
        }
    }

    #[tokio::test]
    async fn test_4xx_fails_without_penalty() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        for status in [400u16, 403, 404] {
            let decision = f
                .handler
                .on_destination_status(&snode_destination(1), status, b"denied", None)
                .await;
            assert!(matches!(
                decision,
                Decision::Fail(Error::Destination { status: s, .. }) if s == status
            ));
        }
        assert!(f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_classification_is_deterministic() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let first = f
            .handler
            .on_destination_status(&snode_destination(1), 404, b"x", None)
            .await;
        let second = f
            .handler
            .on_destination_status(&snode_destination(1), 404, b"x", None)
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_406_resyncs_then_escalates() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let destination = snode_destination(1);

        let first = f
            .handler
            .on_destination_status(&destination, 406, b"", Some("05aa"))
            .await;
        assert_eq!(first, Decision::RetryAfterClockSync);
        assert!(f.clock.needs_sync());
        assert!(f.pool.contains(test_node(1).key()).await);

        // Second consecutive skew from the same destination: evict.
        let second = f
            .handler
            .on_destination_status(&destination, 406, b"", Some("05aa"))
            .await;
        assert_eq!(second, Decision::Retry { exclude_node: None });
        assert!(!f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_success_resets_skew_counter() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let destination = snode_destination(1);

        f.handler
            .on_destination_status(&destination, 406, b"", None)
            .await;
        f.handler.on_success(&destination).await;
        let decision = f
            .handler
            .on_destination_status(&destination, 406, b"", None)
            .await;
        assert_eq!(decision, Decision::RetryAfterClockSync);
        assert!(f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_425_server_pattern() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let destination = server_destination();

        let first = f
            .handler
            .on_destination_status(&destination, 425, b"", None)
            .await;
        assert_eq!(first, Decision::RetryAfterClockSync);

        let second = f
            .handler
            .on_destination_status(&destination, 425, b"", None)
            .await;
        assert!(matches!(second, Decision::Fail(Error::Destination { status: 425, .. })));
    }

    #[tokio::test]
    async fn test_421_prefers_reported_swarm() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        f.swarms
            .store("05aa", vec![test_node(1), test_node(2)])
            .await
            .expect("store");

        let body = serde_json::to_vec(&serde_json::json!({
            "snodes": [
                {"ip": "9.9.9.9", "port": 22021, "pubkey_ed25519": "ee", "pubkey_x25519": "ff"},
            ]
        }))
        .expect("json");
        let decision = f
            .handler
            .on_destination_status(&snode_destination(1), 421, &body, Some("05aa"))
            .await;
        assert_eq!(decision, Decision::Retry { exclude_node: None });

        let swarm = f.swarms.cached("05aa").await.expect("cached");
        assert_eq!(swarm.len(), 1);
        assert_eq!(swarm[0].key(), "ee");
        // The reporting node was not dropped from the pool.
        assert!(f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_421_falls_back_to_single_drop() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        f.swarms
            .store("05aa", vec![test_node(1), test_node(2)])
            .await
            .expect("store");

        let decision = f
            .handler
            .on_destination_status(&snode_destination(1), 421, b"no list here", Some("05aa"))
            .await;
        assert_eq!(decision, Decision::Retry { exclude_node: None });

        let swarm = f.swarms.cached("05aa").await.expect("cached");
        assert_eq!(swarm.len(), 1);
        assert_eq!(swarm[0].key(), test_node(2).key());
    }

    #[tokio::test]
    async fn test_502_unparsable_force_evicts() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let decision = f
            .handler
            .on_destination_status(
                &snode_destination(1),
                502,
                b"Service node returned unparsable data",
                None,
            )
            .await;
        assert_eq!(decision, Decision::Retry { exclude_node: None });
        assert!(!f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_503_not_ready_soft_penalty() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let decision = f
            .handler
            .on_destination_status(&snode_destination(1), 503, b"Snode not ready", None)
            .await;
        assert_eq!(decision, Decision::Retry { exclude_node: None });
        // One strike is below the threshold: still pooled.
        assert!(f.pool.contains(test_node(1).key()).await);
    }

    #[tokio::test]
    async fn test_intermediate_failure_evicts_and_excludes() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let path = f.paths.get_path(None).await.expect("path");
        let victim = path.nodes[1].key().to_string();

        let decision = f
            .handler
            .on_transport_failure(
                &OnionError::IntermediateNodeFailed {
                    failed_key: Some(victim.clone()),
                },
                &path,
            )
            .await;
        assert_eq!(
            decision,
            Decision::Retry {
                exclude_node: Some(victim.clone())
            }
        );
        assert!(!f.pool.contains(&victim).await);
        assert_eq!(f.paths.path_count().await, 0);
    }

    #[tokio::test]
    async fn test_guard_unreachable_penalizes_path_only() {
        let f = fixture((1..=6).map(test_node).collect()).await;
        let path = f.paths.get_path(None).await.expect("path");

        let decision = f
            .handler
            .on_transport_failure(&OnionError::GuardUnreachable("refused".into()), &path)
            .await;
        assert_eq!(decision, Decision::Retry { exclude_node: None });
        // One strike: path degraded but not discarded, nodes untouched.
        assert_eq!(f.paths.path_count().await, 1);
        assert_eq!(f.pool.len().await, 6);
    }
}
