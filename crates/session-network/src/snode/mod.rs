//! Service-node directory: node identity, pool, swarms and network clock.
//!
//! A *service node* ("snode") is a server participating in the
//! decentralized storage network. The *pool* holds every node we know of,
//! a *swarm* is the subset responsible for one account's messages, and the
//! *clock* tracks network-adjusted time for timestamp-signed requests.

mod clock;
mod pool;
mod swarm;

pub use clock::NetworkClock;
pub use pool::{SeedNodeSource, SnodePool, StaticSeed};
pub use swarm::SwarmDirectory;

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single service node.
///
/// Identity is the ed25519 public key; the x25519 key is used for onion
/// layer encryption. Nodes are immutable once constructed and replaced
/// wholesale on directory refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    /// IP address (or hostname) the node listens on.
    pub address: String,
    /// HTTPS port.
    pub port: u16,
    /// Hex ed25519 public key; canonical node identity.
    pub ed25519_pubkey: String,
    /// Hex x25519 public key used for onion encryption.
    pub x25519_pubkey: String,
}

impl ServiceNode {
    /// The node's canonical identity key.
    pub fn key(&self) -> &str {
        &self.ed25519_pubkey
    }

    /// Base HTTPS URL for direct requests to this node.
    pub fn https_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }

    /// Decode the node's x25519 key into raw bytes.
    pub fn x25519_bytes(&self) -> crate::Result<[u8; 32]> {
        decode_key32(&self.x25519_pubkey)
    }

    /// Parse a node from a directory-response JSON object.
    ///
    /// Directory and swarm responses are not uniform across node versions:
    /// the address may arrive as `ip` or `public_ip` and the port as a
    /// number or a string. Returns `None` for entries that are unusable
    /// (missing keys, unroutable `0.0.0.0` address).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let address = value
            .get("ip")
            .or_else(|| value.get("public_ip"))
            .and_then(|v| v.as_str())?
            .to_string();
        if address.is_empty() || address == "0.0.0.0" {
            return None;
        }

        let port_value = value
            .get("port_https")
            .or_else(|| value.get("storage_port"))
            .or_else(|| value.get("port"))?;
        let port = match port_value {
            serde_json::Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };

        let ed25519_pubkey = value.get("pubkey_ed25519")?.as_str()?.to_string();
        let x25519_pubkey = value.get("pubkey_x25519")?.as_str()?.to_string();
        if ed25519_pubkey.is_empty() || x25519_pubkey.is_empty() {
            return None;
        }

        Some(Self {
            address,
            port,
            ed25519_pubkey,
            x25519_pubkey,
        })
    }
}

impl PartialEq for ServiceNode {
    fn eq(&self, other: &Self) -> bool {
        self.ed25519_pubkey == other.ed25519_pubkey
    }
}

impl Eq for ServiceNode {}

impl Hash for ServiceNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ed25519_pubkey.hash(state);
    }
}

/// Decode a 64-character hex key into 32 raw bytes.
pub(crate) fn decode_key32(hex_key: &str) -> crate::Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).map_err(|e| crate::Error::Encoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| crate::Error::Encoding("key is not 32 bytes".into()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ServiceNode;

    /// Build a deterministic test node. The x25519 key is a valid point
    /// derived from the id so onion sealing works against it.
    pub fn test_node(id: u8) -> ServiceNode {
        let secret = x25519_dalek::StaticSecret::from([id; 32]);
        let public = x25519_dalek::PublicKey::from(&secret);
        ServiceNode {
            address: format!("10.0.0.{id}"),
            port: 22021,
            ed25519_pubkey: hex::encode([id; 32]),
            x25519_pubkey: hex::encode(public.as_bytes()),
        }
    }
}
