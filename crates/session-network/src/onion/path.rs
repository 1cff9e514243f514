//! Onion path construction and health tracking.
//!
//! The manager keeps a small pool of three-hop paths built from the snode
//! pool. Paths and nodes each carry a strike counter; crossing the
//! threshold evicts the node (pool, swarms, containing paths) or discards
//! the path. Rebuilds happen lazily on the next [`PathManager::get_path`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::logging::RedactedHex;
use crate::snode::{ServiceNode, SnodePool, SwarmDirectory};
use crate::PATH_HOP_COUNT;

/// Strikes before a path is discarded.
pub const PATH_FAILURE_THRESHOLD: u32 = 3;

/// Strikes before a node is evicted from pool, swarms and paths.
pub const SNODE_FAILURE_THRESHOLD: u32 = 3;

/// Maximum number of live paths kept at once.
const MAX_PATHS: usize = 2;

/// An ordered three-hop onion route. The first node is the guard, the only
/// hop that sees the client's real address.
#[derive(Debug, Clone)]
pub struct OnionPath {
    /// Identifier for strike bookkeeping.
    pub id: u64,
    /// Guard, relay, exit — in hop order.
    pub nodes: Vec<ServiceNode>,
}

impl OnionPath {
    /// The guard node (first hop).
    pub fn guard(&self) -> &ServiceNode {
        &self.nodes[0]
    }

    /// Whether the path contains a node with the given key.
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.iter().any(|n| n.key() == key)
    }
}

struct PathSlot {
    id: u64,
    nodes: Vec<ServiceNode>,
    strikes: u32,
}

#[derive(Default)]
struct PathState {
    paths: Vec<PathSlot>,
    node_strikes: HashMap<String, u32>,
    next_id: u64,
}

/// Builds and maintains the onion path pool.
pub struct PathManager {
    pool: Arc<SnodePool>,
    swarms: Arc<SwarmDirectory>,
    state: RwLock<PathState>,
}

impl PathManager {
    /// Create a manager over the shared directories.
    pub fn new(pool: Arc<SnodePool>, swarms: Arc<SwarmDirectory>) -> Self {
        Self {
            pool,
            swarms,
            state: RwLock::new(PathState::default()),
        }
    }

    /// Return a usable path that does not contain `exclude`.
    ///
    /// Reuses an existing healthy path when possible, otherwise builds a
    /// new one from the pool, preferring nodes with no recent strikes.
    pub async fn get_path(&self, exclude: Option<&str>) -> Result<OnionPath> {
        let dropped = self.pool.dropped_snapshot().await;

        // Prune anything touching a dropped node, then try to reuse.
        {
            let mut state = self.state.write().await;
            state
                .paths
                .retain(|slot| !slot.nodes.iter().any(|n| dropped.contains(n.key())));

            let candidates: Vec<&PathSlot> = state
                .paths
                .iter()
                .filter(|slot| {
                    slot.strikes < PATH_FAILURE_THRESHOLD
                        && exclude.map_or(true, |key| !slot.nodes.iter().any(|n| n.key() == key))
                })
                .collect();
            if let Some(slot) = candidates.choose(&mut rand::thread_rng()) {
                return Ok(OnionPath {
                    id: slot.id,
                    nodes: slot.nodes.clone(),
                });
            }
        }

        self.build_path(exclude, &dropped).await
    }

    async fn build_path(&self, exclude: Option<&str>, dropped: &HashSet<String>) -> Result<OnionPath> {
        let (mut unusable, struck) = {
            let state = self.state.read().await;
            let mut unusable: HashSet<String> = dropped.clone();
            for slot in &state.paths {
                for node in &slot.nodes {
                    unusable.insert(node.key().to_string());
                }
            }
            let struck: HashSet<String> = state.node_strikes.keys().cloned().collect();
            (unusable, struck)
        };
        if let Some(key) = exclude {
            unusable.insert(key.to_string());
        }

        // Prefer nodes that have never recently failed; fall back to
        // including struck nodes when the pool is thin.
        let mut preferred = unusable.clone();
        preferred.extend(struck);
        let nodes = match self
            .pool
            .random_nodes_excluding(PATH_HOP_COUNT, &preferred)
            .await
        {
            Ok(nodes) => nodes,
            Err(crate::Error::InsufficientNodes { .. }) => {
                self.pool
                    .random_nodes_excluding(PATH_HOP_COUNT, &unusable)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let mut state = self.state.write().await;
        if state.paths.len() >= MAX_PATHS {
            // Another task built one while we were selecting; reuse it if
            // it satisfies the exclusion.
            if let Some(slot) = state.paths.iter().find(|slot| {
                slot.strikes < PATH_FAILURE_THRESHOLD
                    && exclude.map_or(true, |key| !slot.nodes.iter().any(|n| n.key() == key))
            }) {
                return Ok(OnionPath {
                    id: slot.id,
                    nodes: slot.nodes.clone(),
                });
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state.paths.push(PathSlot {
            id,
            nodes: nodes.clone(),
            strikes: 0,
        });
        info!(
            "built onion path {} via guard {}",
            id,
            RedactedHex(nodes[0].key())
        );
        Ok(OnionPath { id, nodes })
    }

    /// Record a strike against a node; evict it everywhere once the
    /// threshold is reached or when `force` is set.
    pub async fn handle_bad_snode(&self, key: &str, swarm_pubkey: Option<&str>, force: bool) {
        let evict = {
            let mut state = self.state.write().await;
            let strikes = state.node_strikes.entry(key.to_string()).or_insert(0);
            *strikes += 1;
            let evict = force || *strikes >= SNODE_FAILURE_THRESHOLD;
            if evict {
                state.node_strikes.remove(key);
                state.paths.retain(|slot| !slot.nodes.iter().any(|n| n.key() == key));
            }
            evict
        };

        if evict {
            warn!("evicting snode {}", RedactedHex(key));
            self.pool.drop_snode(key).await;
            if let Some(pubkey) = swarm_pubkey {
                self.swarms.drop_member(key, pubkey).await;
            }
        } else {
            debug!("strike against snode {}", RedactedHex(key));
        }
    }

    /// Record a strike against a path; discard it once the threshold is
    /// reached. Individual nodes are not blamed.
    pub async fn handle_bad_path(&self, path_id: u64) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.paths.iter_mut().find(|slot| slot.id == path_id) {
            slot.strikes += 1;
            if slot.strikes >= PATH_FAILURE_THRESHOLD {
                warn!("discarding onion path {path_id}");
                state.paths.retain(|slot| slot.id != path_id);
            }
        }
    }

    /// Reset a path's strike counter after a successful request.
    pub async fn mark_path_healthy(&self, path_id: u64) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.paths.iter_mut().find(|slot| slot.id == path_id) {
            slot.strikes = 0;
        }
    }

    /// Number of live paths.
    pub async fn path_count(&self) -> usize {
        self.state.read().await.paths.len()
    }
}
