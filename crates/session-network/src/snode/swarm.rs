//! Per-account swarm membership cache.
//!
//! A swarm is the set of service nodes responsible for one account's
//! stored messages. Entries are populated by the client on first use and
//! invalidated on membership-mismatch (421) errors. This type is a pure
//! local store; the network fetch lives in
//! [`SnodeClient::swarm_for`](crate::network::SnodeClient::swarm_for).

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::logging::RedactedHex;
use crate::snode::ServiceNode;

#[derive(Default)]
struct SwarmEntry {
    nodes: Vec<ServiceNode>,
    stale: bool,
}

/// Cache of account public key to swarm members.
#[derive(Default)]
pub struct SwarmDirectory {
    entries: RwLock<HashMap<String, SwarmEntry>>,
}

impl SwarmDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached swarm for an account, if present and not stale.
    ///
    /// Never returns an empty set; an entry with no members is treated as
    /// absent so the caller re-fetches.
    pub async fn cached(&self, pubkey: &str) -> Option<Vec<ServiceNode>> {
        let entries = self.entries.read().await;
        let entry = entries.get(pubkey)?;
        if entry.stale || entry.nodes.is_empty() {
            return None;
        }
        Some(entry.nodes.clone())
    }

    /// Store a freshly fetched swarm.
    ///
    /// An empty member set is a directory fetch failure, not a valid
    /// swarm, and is rejected.
    pub async fn store(&self, pubkey: &str, nodes: Vec<ServiceNode>) -> Result<()> {
        if nodes.is_empty() {
            return Err(Error::SwarmFetch("fetched swarm was empty".into()));
        }
        let mut entries = self.entries.write().await;
        entries.insert(
            pubkey.to_string(),
            SwarmEntry {
                nodes,
                stale: false,
            },
        );
        Ok(())
    }

    /// Remove a single member from an account's swarm.
    ///
    /// If the swarm would become empty it is marked for a full refresh on
    /// next access instead of being served empty.
    pub async fn drop_member(&self, node_key: &str, pubkey: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(pubkey) {
            entry.nodes.retain(|n| n.key() != node_key);
            debug!(
                "dropped snode {} from swarm {}",
                RedactedHex(node_key),
                RedactedHex(pubkey)
            );
            if entry.nodes.is_empty() {
                entry.stale = true;
            }
        }
    }

    /// Mark an account's swarm for refresh on next access.
    pub async fn mark_stale(&self, pubkey: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(pubkey) {
            entry.stale = true;
        }
    }

    /// Apply a destination's self-reported swarm from a 421 error body.
    ///
    /// Returns whether an update was applied. `false` means the body did
    /// not carry a usable member list and the caller should fall back to
    /// dropping just the one bad node; the cached entry is left intact in
    /// that case.
    pub async fn update_from_response(&self, pubkey: &str, body: &[u8]) -> bool {
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let Some(raw_nodes) = value.get("snodes").and_then(|v| v.as_array()) else {
            return false;
        };
        let nodes: Vec<ServiceNode> = raw_nodes.iter().filter_map(ServiceNode::from_json).collect();
        if nodes.is_empty() {
            warn!(
                "421 body for {} carried no usable snodes",
                RedactedHex(pubkey)
            );
            return false;
        }
        debug!(
            "swarm for {} updated from 421 body, {} members",
            RedactedHex(pubkey),
            nodes.len()
        );
        let mut entries = self.entries.write().await;
        entries.insert(
            pubkey.to_string(),
            SwarmEntry {
                nodes,
                stale: false,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snode::test_support::test_node;
    use serde_json::json;

    const ACCOUNT: &str = "05aabbccdd";

    #[tokio::test]
    async fn test_store_rejects_empty() {
        let dir = SwarmDirectory::new();
        assert!(matches!(
            dir.store(ACCOUNT, vec![]).await,
            Err(Error::SwarmFetch(_))
        ));
        assert!(dir.cached(ACCOUNT).await.is_none());
    }

    #[tokio::test]
    async fn test_drop_member_marks_stale_when_emptied() {
        let dir = SwarmDirectory::new();
        dir.store(ACCOUNT, vec![test_node(1)]).await.expect("store");
        dir.drop_member(test_node(1).key(), ACCOUNT).await;
        // Never served empty: entry is gone from the caller's view.
        assert!(dir.cached(ACCOUNT).await.is_none());
    }

    #[tokio::test]
    async fn test_drop_member_keeps_rest() {
        let dir = SwarmDirectory::new();
        dir.store(ACCOUNT, vec![test_node(1), test_node(2)])
            .await
            .expect("store");
        dir.drop_member(test_node(1).key(), ACCOUNT).await;
        let cached = dir.cached(ACCOUNT).await.expect("still cached");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].key(), test_node(2).key());
    }

    #[tokio::test]
    async fn test_update_from_response() {
        let dir = SwarmDirectory::new();
        let body = serde_json::to_vec(&json!({
            "snodes": [
                {"ip": "1.1.1.1", "port": 22021, "pubkey_ed25519": "aa", "pubkey_x25519": "bb"},
                {"ip": "2.2.2.2", "port": "22021", "pubkey_ed25519": "cc", "pubkey_x25519": "dd"},
            ]
        }))
        .expect("json");

        assert!(dir.update_from_response(ACCOUNT, &body).await);
        assert_eq!(dir.cached(ACCOUNT).await.expect("cached").len(), 2);
    }

    #[tokio::test]
    async fn test_update_from_response_bad_body_leaves_cache() {
        let dir = SwarmDirectory::new();
        dir.store(ACCOUNT, vec![test_node(1)]).await.expect("store");

        assert!(!dir.update_from_response(ACCOUNT, b"not json").await);
        assert!(!dir.update_from_response(ACCOUNT, b"{\"snodes\": []}").await);
        assert!(
            !dir.update_from_response(ACCOUNT, b"{\"snodes\": [{\"ip\": \"0.0.0.0\"}]}")
                .await
        );
        // Fallback path still has the original member to drop.
        assert_eq!(dir.cached(ACCOUNT).await.expect("cached").len(), 1);
    }

    #[tokio::test]
    async fn test_mark_stale_forces_refetch() {
        let dir = SwarmDirectory::new();
        dir.store(ACCOUNT, vec![test_node(1)]).await.expect("store");
        dir.mark_stale(ACCOUNT).await;
        assert!(dir.cached(ACCOUNT).await.is_none());
    }
}
