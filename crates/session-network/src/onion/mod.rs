//! Onion routing: destinations, paths, layer encryption and transport.
//!
//! A request is wrapped in nested encryption layers keyed to each hop of a
//! three-node path (guard, relay, exit) plus the final destination, then
//! POSTed to the guard node. The transport only detects and categorizes
//! failure; retry policy lives in [`crate::network`].

mod encryption;
mod envelope;
mod path;
mod transport;

pub use encryption::{build_onion, open_response, BuiltOnion};
pub(crate) use encryption::{open_with_key, seal_with_key, KEY_SIZE};
pub use envelope::{decode as decode_envelope, encode as encode_envelope, DecodedEnvelope};
pub use path::{OnionPath, PathManager, PATH_FAILURE_THRESHOLD, SNODE_FAILURE_THRESHOLD};
pub use transport::{HttpsOnionTransport, OnionTransport};

use thiserror::Error;

use crate::snode::ServiceNode;

/// Onion request protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnionVersion {
    /// JSON status/body response envelope.
    V3,
    /// Length-prefixed header+body response envelope.
    V4,
}

/// Final hop of an onion request.
#[derive(Debug, Clone)]
pub enum OnionDestination {
    /// The final hop is a service node.
    Snode(ServiceNode),
    /// The final hop is an HTTPS server reached through the exit node.
    Server {
        /// Server hostname.
        host: String,
        /// Server port.
        port: u16,
        /// URL scheme, `https` in practice.
        scheme: String,
        /// Hex x25519 key the destination layer is encrypted to.
        x25519_pubkey: String,
        /// Request target (path) on the server.
        target: String,
    },
}

impl OnionDestination {
    /// Stable identity for this destination, used for consecutive-failure
    /// tracking.
    pub fn id(&self) -> String {
        match self {
            OnionDestination::Snode(node) => node.key().to_string(),
            OnionDestination::Server { host, port, .. } => format!("{host}:{port}"),
        }
    }

    /// The destination's x25519 key bytes.
    pub fn x25519_bytes(&self) -> crate::Result<[u8; 32]> {
        match self {
            OnionDestination::Snode(node) => node.x25519_bytes(),
            OnionDestination::Server { x25519_pubkey, .. } => {
                crate::snode::decode_key32(x25519_pubkey)
            }
        }
    }
}

/// Raw result of a fully unwrapped onion request.
///
/// `status: None` means every hop and the destination succeeded.
#[derive(Debug, Clone)]
pub struct OnionResponse {
    /// Error status surfaced from the destination, if any.
    pub status: Option<u16>,
    /// Response body.
    pub body: Vec<u8>,
}

impl OnionResponse {
    /// Whether the request succeeded end to end.
    pub fn is_success(&self) -> bool {
        self.status.is_none()
    }
}

/// Where an onion request failed.
///
/// Produced by the transport; consumed by the failure classifiers. The
/// variants carry enough context to decide whether to blame a node, the
/// path, or the destination.
#[derive(Error, Debug, Clone)]
pub enum OnionError {
    /// An intermediate hop reported failure, naming the broken node when
    /// it could be identified.
    #[error("intermediate node failed")]
    IntermediateNodeFailed {
        /// Ed25519 key of the failed node, when reported.
        failed_key: Option<String>,
    },

    /// The route itself failed without an identifiable node.
    #[error("path error")]
    PathError(String),

    /// The guard node could not be reached at all.
    #[error("guard unreachable")]
    GuardUnreachable(String),

    /// The onion response envelope was malformed.
    #[error("invalid onion response")]
    InvalidResponse(String),

    /// The destination answered with an error status.
    #[error("destination error {status}")]
    DestinationError {
        /// HTTP status from the destination.
        status: u16,
        /// Response body, when present.
        body: Option<String>,
    },

    /// Anything else.
    #[error("onion request failed")]
    Unknown(String),
}
