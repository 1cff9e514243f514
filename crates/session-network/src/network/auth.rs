//! Swarm authentication and signed parameter construction.
//!
//! Service nodes verify request signatures server-side against a canonical
//! byte string, so the concatenations here must be reproduced exactly:
//! `store`/`retrieve` sign `method + namespace-text + timestamp` (namespace
//! text omitted when 0), `delete` signs `method + concatenated hashes`,
//! `expire` signs `method + flag-text + expiry + concatenated hashes` —
//! all with no separators.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Per-account signing capability.
///
/// Key material is owned by the application layer, not the network core;
/// callers pass an implementation into each authenticated request.
pub trait SwarmAuth: Send + Sync {
    /// Hex account id (the `pubkey` wire field).
    fn account_id(&self) -> &str;

    /// Hex ed25519 public key, when the account signs with a key distinct
    /// from its account id.
    fn ed25519_pubkey_hex(&self) -> Option<String>;

    /// Sign the canonical message bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// [`SwarmAuth`] backed by an in-memory ed25519 keypair.
pub struct KeyPairAuth {
    account_id: String,
    signing_key: SigningKey,
}

impl KeyPairAuth {
    /// Create from an account id and ed25519 secret key bytes.
    pub fn new(account_id: impl Into<String>, secret: [u8; 32]) -> Self {
        Self {
            account_id: account_id.into(),
            signing_key: SigningKey::from_bytes(&secret),
        }
    }
}

impl SwarmAuth for KeyPairAuth {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn ed25519_pubkey_hex(&self) -> Option<String> {
        Some(hex::encode(self.signing_key.verifying_key().as_bytes()))
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Direction of a stored-message expiry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlChange {
    /// Only move expiries earlier.
    Shorten,
    /// Only move expiries later.
    Extend,
}

impl TtlChange {
    /// Canonical flag text included in the signature and the wire params.
    pub fn flag(self) -> &'static str {
        match self {
            TtlChange::Shorten => "shorten",
            TtlChange::Extend => "extend",
        }
    }
}

/// Namespace rendered for canonical signing: empty for the default.
fn namespace_text(namespace: i32) -> String {
    if namespace == 0 {
        String::new()
    } else {
        namespace.to_string()
    }
}

/// Canonical bytes for `store`/`retrieve`-shaped operations.
pub(crate) fn timestamped_message(method: &str, namespace: i32, timestamp_ms: u64) -> Vec<u8> {
    format!("{method}{}{timestamp_ms}", namespace_text(namespace)).into_bytes()
}

/// Canonical bytes for `delete`: method plus concatenated hashes.
pub(crate) fn delete_message(hashes: &[String]) -> Vec<u8> {
    let mut message = b"delete".to_vec();
    for hash in hashes {
        message.extend_from_slice(hash.as_bytes());
    }
    message
}

/// Canonical bytes for `delete_all`.
pub(crate) fn delete_all_message(namespace: i32, timestamp_ms: u64) -> Vec<u8> {
    timestamped_message("delete_all", namespace, timestamp_ms)
}

/// Canonical bytes for `expire`: method, flag, expiry, hashes.
pub(crate) fn expire_message(change: TtlChange, expiry_ms: u64, hashes: &[String]) -> Vec<u8> {
    let mut message = format!("expire{}{expiry_ms}", change.flag()).into_bytes();
    for hash in hashes {
        message.extend_from_slice(hash.as_bytes());
    }
    message
}

/// Merge account identity and a signature over `message` into `params`.
///
/// Inserts `pubkey`, optional `pubkey_ed25519`, `namespace` (omitted when
/// 0), `sig_timestamp` and the base64 `signature`.
pub(crate) fn apply_signature(
    params: &mut Map<String, Value>,
    auth: &dyn SwarmAuth,
    namespace: i32,
    timestamp_ms: u64,
    message: &[u8],
) -> Result<()> {
    let signature = auth
        .sign(message)
        .map_err(|e| Error::Signing(e.to_string()))?;

    params.insert("pubkey".into(), Value::String(auth.account_id().into()));
    if let Some(ed25519) = auth.ed25519_pubkey_hex() {
        params.insert("pubkey_ed25519".into(), Value::String(ed25519));
    }
    if namespace != 0 {
        params.insert("namespace".into(), Value::from(namespace));
    }
    params.insert("sig_timestamp".into(), Value::from(timestamp_ms));
    params.insert("signature".into(), Value::String(BASE64.encode(signature)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn test_auth() -> KeyPairAuth {
        KeyPairAuth::new("05aabb", [7u8; 32])
    }

    #[test]
    fn test_store_canonical_bytes() {
        // "store" + namespace-text + timestamp, no separators.
        assert_eq!(
            timestamped_message("store", 5, 1_700_000_000_123),
            b"store51700000000123".to_vec()
        );
    }

    #[test]
    fn test_default_namespace_omitted_from_canonical_bytes() {
        assert_eq!(
            timestamped_message("store", 0, 1_700_000_000_123),
            b"store1700000000123".to_vec()
        );
        assert_eq!(
            timestamped_message("retrieve", -10, 99),
            b"retrieve-1099".to_vec()
        );
    }

    #[test]
    fn test_delete_concatenates_hashes() {
        let hashes = vec!["abc".to_string(), "def".to_string()];
        assert_eq!(delete_message(&hashes), b"deleteabcdef".to_vec());
    }

    #[test]
    fn test_expire_canonical_bytes() {
        let hashes = vec!["h1".to_string(), "h2".to_string()];
        assert_eq!(
            expire_message(TtlChange::Shorten, 42_000, &hashes),
            b"expireshorten42000h1h2".to_vec()
        );
        assert_eq!(
            expire_message(TtlChange::Extend, 42_000, &[]),
            b"expireextend42000".to_vec()
        );
    }

    #[test]
    fn test_apply_signature_fields() {
        let auth = test_auth();
        let mut params = Map::new();
        let message = timestamped_message("store", 5, 1000);
        apply_signature(&mut params, &auth, 5, 1000, &message).expect("sign");

        assert_eq!(params["pubkey"], "05aabb");
        assert_eq!(params["namespace"], 5);
        assert_eq!(params["sig_timestamp"], 1000);
        assert!(params.contains_key("pubkey_ed25519"));

        // The signature verifies against the canonical bytes.
        let signature_bytes = BASE64
            .decode(params["signature"].as_str().expect("string"))
            .expect("base64");
        let signature =
            ed25519_dalek::Signature::from_slice(&signature_bytes).expect("signature");
        let verifying_key = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        assert!(verifying_key.verify(&message, &signature).is_ok());
    }

    #[test]
    fn test_default_namespace_omitted_from_params() {
        let auth = test_auth();
        let mut params = Map::new();
        let message = timestamped_message("store", 0, 1000);
        apply_signature(&mut params, &auth, 0, 1000, &message).expect("sign");
        assert!(!params.contains_key("namespace"));
    }
}
