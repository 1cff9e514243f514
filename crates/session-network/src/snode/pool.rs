//! The snode pool: every service node the client currently knows about.
//!
//! The pool is populated lazily from a seed source on first access and
//! replaced wholesale on refresh. Nodes evicted for misbehaviour stay on a
//! dropped list until the next full refresh so rebuilt paths never pick
//! them up again.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::snode::ServiceNode;

/// Source of bootstrap nodes used to (re)populate the pool.
///
/// Production implementations fetch from hardcoded seed servers; tests
/// supply a static list.
#[async_trait]
pub trait SeedNodeSource: Send + Sync {
    /// Fetch the full snode list from a seed/bootstrap source.
    async fn fetch_snode_pool(&self) -> Result<Vec<ServiceNode>>;
}

/// A static, in-memory seed source.
pub struct StaticSeed(pub Vec<ServiceNode>);

#[async_trait]
impl SeedNodeSource for StaticSeed {
    async fn fetch_snode_pool(&self) -> Result<Vec<ServiceNode>> {
        Ok(self.0.clone())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PoolState {
    nodes: HashMap<String, ServiceNode>,
    dropped: HashSet<String>,
    populated: bool,
}

/// The shared pool of known service nodes.
pub struct SnodePool {
    seed: Arc<dyn SeedNodeSource>,
    state: RwLock<PoolState>,
}

impl SnodePool {
    /// Create an empty pool backed by the given seed source.
    pub fn new(seed: Arc<dyn SeedNodeSource>) -> Self {
        Self {
            seed,
            state: RwLock::new(PoolState::default()),
        }
    }

    /// Return a random node from the pool.
    ///
    /// Populates the pool from the seed source on first access. Fails with
    /// [`Error::EmptyPool`] when no nodes are available even after that.
    pub async fn get_random_snode(&self) -> Result<ServiceNode> {
        self.ensure_populated().await?;
        let state = self.state.read().await;
        let nodes: Vec<&ServiceNode> = state.nodes.values().collect();
        nodes
            .choose(&mut rand::thread_rng())
            .map(|n| (*n).clone())
            .ok_or(Error::EmptyPool)
    }

    /// Return `count` distinct random nodes whose keys are not in `exclude`.
    ///
    /// Fails with [`Error::InsufficientNodes`] when fewer than `count`
    /// usable nodes remain.
    pub async fn random_nodes_excluding(
        &self,
        count: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<ServiceNode>> {
        self.ensure_populated().await?;
        let state = self.state.read().await;
        let mut candidates: Vec<&ServiceNode> = state
            .nodes
            .values()
            .filter(|n| !exclude.contains(n.key()))
            .collect();
        if candidates.len() < count {
            return Err(Error::InsufficientNodes {
                available: candidates.len(),
            });
        }
        candidates.shuffle(&mut rand::thread_rng());
        Ok(candidates.into_iter().take(count).cloned().collect())
    }

    /// Remove a node from the pool. Idempotent.
    ///
    /// The key stays on the dropped list until the next full refresh.
    pub async fn drop_snode(&self, key: &str) {
        let mut state = self.state.write().await;
        if state.nodes.remove(key).is_some() {
            debug!("dropped snode {} from pool", RedactedHex(key));
        }
        state.dropped.insert(key.to_string());
    }

    /// Whether a key has been dropped since the last refresh.
    pub async fn is_dropped(&self, key: &str) -> bool {
        self.state.read().await.dropped.contains(key)
    }

    /// Snapshot of all keys dropped since the last refresh.
    pub async fn dropped_snapshot(&self) -> HashSet<String> {
        self.state.read().await.dropped.clone()
    }

    /// Whether a node is currently in the pool.
    pub async fn contains(&self, key: &str) -> bool {
        self.state.read().await.nodes.contains_key(key)
    }

    /// Replace the pool contents wholesale and clear the dropped list.
    pub async fn update(&self, nodes: Vec<ServiceNode>) {
        let mut state = self.state.write().await;
        state.nodes = nodes.into_iter().map(|n| (n.key().to_string(), n)).collect();
        state.dropped.clear();
        state.populated = !state.nodes.is_empty();
        info!("snode pool updated, {} nodes", state.nodes.len());
    }

    /// Number of nodes currently in the pool.
    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// Whether the pool is currently empty.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    /// Fetch from the seed source and replace the pool.
    pub async fn refresh_from_seed(&self) -> Result<usize> {
        let nodes = self.seed.fetch_snode_pool().await?;
        if nodes.is_empty() {
            warn!("seed source returned no snodes");
            return Err(Error::EmptyPool);
        }
        let count = nodes.len();
        self.update(nodes).await;
        Ok(count)
    }

    async fn ensure_populated(&self) -> Result<()> {
        if self.state.read().await.populated {
            return Ok(());
        }
        self.refresh_from_seed().await?;
        Ok(())
    }

    /// Load a previously persisted pool cache.
    ///
    /// Returns whether a cache was found. A loaded cache counts as
    /// populated, so the seed source is only contacted again on an
    /// explicit refresh.
    pub async fn load_cache(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let data = tokio::fs::read(path).await?;
        let cached: PoolState =
            bincode::deserialize(&data).map_err(|e| Error::Storage(e.to_string()))?;
        let mut state = self.state.write().await;
        *state = cached;
        debug!("loaded snode pool cache, {} nodes", state.nodes.len());
        Ok(true)
    }

    /// Persist the pool to disk for the next session.
    pub async fn persist_cache(&self, path: &Path) -> Result<()> {
        let state = self.state.read().await;
        let data = bincode::serialize(&*state).map_err(|e| Error::Storage(e.to_string()))?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snode::test_support::test_node;

    fn pool_with(nodes: Vec<ServiceNode>) -> SnodePool {
        SnodePool::new(Arc::new(StaticSeed(nodes)))
    }

    #[tokio::test]
    async fn test_lazy_populate_on_first_access() {
        let pool = pool_with(vec![test_node(1), test_node(2)]);
        assert!(pool.is_empty().await);
        let node = pool.get_random_snode().await.expect("should populate");
        assert!(!node.address.is_empty());
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_empty_seed_is_empty_pool_error() {
        let pool = pool_with(vec![]);
        assert!(matches!(
            pool.get_random_snode().await,
            Err(Error::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn test_drop_is_idempotent_and_sticky() {
        let pool = pool_with(vec![test_node(1), test_node(2)]);
        pool.refresh_from_seed().await.expect("seed");
        let key = test_node(1).key().to_string();

        pool.drop_snode(&key).await;
        pool.drop_snode(&key).await;
        assert!(!pool.contains(&key).await);
        assert!(pool.is_dropped(&key).await);
        assert_eq!(pool.len().await, 1);

        // A full refresh clears the dropped list.
        pool.refresh_from_seed().await.expect("seed");
        assert!(!pool.is_dropped(&key).await);
        assert!(pool.contains(&key).await);
    }

    #[tokio::test]
    async fn test_random_nodes_excluding() {
        let pool = pool_with(vec![test_node(1), test_node(2), test_node(3), test_node(4)]);
        let mut exclude = HashSet::new();
        exclude.insert(test_node(4).key().to_string());

        let nodes = pool
            .random_nodes_excluding(3, &exclude)
            .await
            .expect("should select");
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.key() != test_node(4).key()));

        exclude.insert(test_node(3).key().to_string());
        assert!(matches!(
            pool.random_nodes_excluding(3, &exclude).await,
            Err(Error::InsufficientNodes { available: 2 })
        ));
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.bin");

        let pool = pool_with(vec![test_node(1), test_node(2)]);
        pool.refresh_from_seed().await.expect("seed");
        pool.drop_snode(test_node(2).key()).await;
        pool.persist_cache(&path).await.expect("persist");

        let restored = pool_with(vec![]);
        assert!(restored.load_cache(&path).await.expect("load"));
        assert_eq!(restored.len().await, 1);
        assert!(restored.is_dropped(test_node(2).key()).await);

        // Loaded cache counts as populated: the (empty) seed is not hit.
        assert!(restored.get_random_snode().await.is_ok());
    }

    #[tokio::test]
    async fn test_load_cache_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool_with(vec![]);
        let loaded = pool
            .load_cache(&dir.path().join("missing.bin"))
            .await
            .expect("no error");
        assert!(!loaded);
    }
}
