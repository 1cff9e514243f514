//! Nested onion layer encryption.
//!
//! Each hop's layer is sealed with an ephemeral X25519 exchange against the
//! hop's static x25519 key, HKDF-SHA256 key derivation and
//! ChaCha20-Poly1305. The innermost layer is keyed to the destination, the
//! outermost to the guard. The destination encrypts its response with the
//! same destination-layer key, which we keep as the reply key.
//!
//! Layer plaintext framing is length-prefixed: a 4-byte little-endian JSON
//! control length, the control object, then the inner ciphertext. Control
//! objects tell each relay where to forward and which ephemeral key the
//! next hop should use.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::onion::OnionDestination;
use crate::snode::ServiceNode;

/// Layer key size in bytes.
pub(crate) const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes.
pub(crate) const NONCE_SIZE: usize = 12;

/// AEAD tag size in bytes.
pub(crate) const TAG_SIZE: usize = 16;

const LAYER_KEY_INFO: &[u8] = b"session-onion-layer";

/// A fully built onion request ready for the guard node.
pub struct BuiltOnion {
    /// Framed ciphertext to POST to the guard.
    pub payload: Vec<u8>,
    /// Symmetric key of the destination layer; decrypts the response.
    pub reply_key: Zeroizing<[u8; KEY_SIZE]>,
}

/// Derive a layer key from an X25519 exchange.
///
/// Salted with both public keys so the key binds sender and recipient.
pub(crate) fn derive_layer_key(
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
    shared: &[u8; 32],
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_pub);
    salt.extend_from_slice(recipient_pub);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(LAYER_KEY_INFO, key.as_mut())
        .map_err(|_| Error::Crypto("layer key derivation failed".into()))?;
    Ok(key)
}

/// Encrypt with a random nonce, prepending it to the output.
pub(crate) fn seal_with_key(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("layer encryption failed".into()))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data sealed with [`seal_with_key`].
pub(crate) fn open_with_key(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
        .map_err(|_| Error::Crypto("layer decryption failed".into()))
}

/// Seal one layer for a recipient's x25519 key.
///
/// Returns the ephemeral public key, the sealed bytes, and the symmetric
/// key (kept only for the destination layer, to open the reply).
fn seal_layer(
    recipient_x25519: &[u8; 32],
    plaintext: &[u8],
) -> Result<([u8; 32], Vec<u8>, Zeroizing<[u8; KEY_SIZE]>)> {
    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let recipient = PublicKey::from(*recipient_x25519);
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_layer_key(ephemeral_pub.as_bytes(), recipient_x25519, shared.as_bytes())?;
    let sealed = seal_with_key(&key, plaintext)?;
    Ok((*ephemeral_pub.as_bytes(), sealed, key))
}

/// Frame a control object and payload: `len(json) LE32 || json || payload`.
pub(crate) fn frame(control: &serde_json::Value, payload: &[u8]) -> Result<Vec<u8>> {
    let control_bytes = serde_json::to_vec(control)?;
    let mut framed = Vec::with_capacity(4 + control_bytes.len() + payload.len());
    framed.extend_from_slice(&(control_bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&control_bytes);
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Split a frame back into its control object and payload.
pub(crate) fn unframe(data: &[u8]) -> Result<(serde_json::Value, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Encoding("frame too short".into()));
    }
    let control_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let end = 4usize
        .checked_add(control_len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::Encoding("frame length out of bounds".into()))?;
    let control = serde_json::from_slice(&data[4..end])?;
    Ok((control, &data[end..]))
}

fn relay_control(next_key: &str, next_ephemeral: &[u8; 32]) -> serde_json::Value {
    json!({
        "destination_ed25519": next_key,
        "ephemeral_key": hex::encode(next_ephemeral),
    })
}

fn destination_control(
    destination: &OnionDestination,
    ephemeral: &[u8; 32],
) -> serde_json::Value {
    match destination {
        OnionDestination::Snode(node) => relay_control(node.key(), ephemeral),
        OnionDestination::Server {
            host,
            port,
            scheme,
            target,
            ..
        } => json!({
            "host": host,
            "port": port,
            "protocol": scheme,
            "target": target,
            "ephemeral_key": hex::encode(ephemeral),
        }),
    }
}

/// Build a complete onion for `payload` through `path` to `destination`.
///
/// `path` is in hop order (guard first); the destination layer is sealed
/// first, then each relay layer from the exit inward to the guard.
pub fn build_onion(
    path: &[ServiceNode],
    destination: &OnionDestination,
    payload: &[u8],
) -> Result<BuiltOnion> {
    if path.is_empty() {
        return Err(Error::Crypto("cannot build onion over empty path".into()));
    }

    let dest_x25519 = destination.x25519_bytes()?;
    let (dest_ephemeral, mut ciphertext, reply_key) = seal_layer(&dest_x25519, payload)?;
    let mut control = destination_control(destination, &dest_ephemeral);

    // Relay layers, exit-side inward. Each relay decrypts its layer, reads
    // the control object, and forwards the inner ciphertext.
    for node in path.iter().skip(1).rev() {
        let plaintext = frame(&control, &ciphertext)?;
        let recipient = node.x25519_bytes()?;
        let (ephemeral, sealed, _key) = seal_layer(&recipient, &plaintext)?;
        ciphertext = sealed;
        control = relay_control(node.key(), &ephemeral);
    }

    // Guard layer; its ephemeral key travels in the clear.
    let plaintext = frame(&control, &ciphertext)?;
    let guard_key = path[0].x25519_bytes()?;
    let (guard_ephemeral, sealed, _key) = seal_layer(&guard_key, &plaintext)?;
    let wire = frame(
        &json!({ "ephemeral_key": hex::encode(guard_ephemeral) }),
        &sealed,
    )?;

    Ok(BuiltOnion {
        payload: wire,
        reply_key,
    })
}

/// Decrypt the destination's response with the reply key kept from
/// [`build_onion`].
pub fn open_response(reply_key: &[u8; KEY_SIZE], body: &[u8]) -> Result<Vec<u8>> {
    open_with_key(reply_key, body)
}
