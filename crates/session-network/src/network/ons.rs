//! Name-to-account resolution.
//!
//! Registered names map to account ids, but the mapping lives on service
//! nodes and a single node could lie. Resolution therefore queries three
//! distinct nodes and only accepts a unanimous answer. Lookups are blind:
//! the wire carries a hash of the name, and the stored value is encrypted
//! under a key only someone who knows the plaintext name can derive.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::snode_client::SnodeClient;
use crate::onion::{open_with_key, KEY_SIZE};

/// Distinct nodes that must agree on a resolution.
const LOOKUP_QUORUM: usize = 3;

/// Domain separator for the value decryption key.
const VALUE_KEY_INFO: &[u8] = b"session-ons-value";

/// Resolve a registered name to its account id.
pub(crate) async fn resolve(client: &SnodeClient, name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(Error::Validation("name is empty".into()));
    }

    let hash = name_hash(&name);
    let params = json!({
        "type": 0,
        "name_hash": BASE64.encode(hash),
    });

    let nodes = client
        .pool()
        .random_nodes_excluding(LOOKUP_QUORUM, &HashSet::new())
        .await?;

    let mut ids = Vec::with_capacity(LOOKUP_QUORUM);
    for node in nodes {
        let response = client
            .invoke(node, "", "ons_resolve", params.clone())
            .await?;
        ids.push(decrypt_value(&name, &hash, &response.body)?);
    }

    let id = reconcile(&ids)?;
    debug!("resolved name to account");
    Ok(id)
}

/// Hash a (lowercased) name for blind lookup.
fn name_hash(name: &str) -> [u8; 32] {
    Sha256::digest(name.as_bytes()).into()
}

/// Derive the value decryption key from the plaintext name.
fn value_key(name: &str, hash: &[u8; 32]) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(hash), name.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hk.expand(VALUE_KEY_INFO, &mut key)
        .map_err(|_| Error::Crypto("value key derivation failed".into()))?;
    Ok(key)
}

/// Decrypt the `encrypted_value` field of one resolution response.
fn decrypt_value(name: &str, hash: &[u8; 32], body: &Value) -> Result<String> {
    let encrypted = body
        .get("encrypted_value")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidResponse("resolution missing encrypted_value".into()))?;
    let ciphertext = hex::decode(encrypted).map_err(|e| Error::Encoding(e.to_string()))?;

    let key = value_key(name, hash)?;
    let plaintext = open_with_key(&key, &ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| Error::InvalidResponse("account id is not utf-8".into()))
}

/// Accept the resolved ids only when every node agreed.
fn reconcile(ids: &[String]) -> Result<String> {
    match ids.split_first() {
        Some((first, rest)) if rest.iter().all(|id| id == first) => Ok(first.clone()),
        Some(_) => Err(Error::Validation("resolution nodes disagreed".into())),
        None => Err(Error::Validation("no resolution responses".into())),
    }
}
