//! # Session network core
//!
//! Onion-routed client core for the Session messaging network. The
//! surrounding application hands this crate encrypted payloads and swarm
//! signing material; the crate takes care of everything between the caller
//! and the service-node ("snode") network:
//!
//! - a decentralized snode directory with per-account swarm membership,
//! - a small pool of rotating three-hop onion paths,
//! - onion-encrypted request construction and dispatch,
//! - failure classification that turns transport and destination errors
//!   into node/path penalties, clock resyncs or swarm refreshes,
//! - retry/backoff orchestration with micro-batching of concurrent
//!   requests to the same destination.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Application                   │
//! ├───────────────────────────────────────────────┤
//! │  SnodeClient  │  ServerClient  │  batching    │
//! ├───────────────────────────────────────────────┤
//! │        SessionNetwork + FailureHandler        │
//! ├───────────────────────────────────────────────┤
//! │  PathManager  │  OnionTransport (encryption)  │
//! ├───────────────────────────────────────────────┤
//! │   SnodePool   │  SwarmDirectory  │   Clock    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! All services are explicitly constructed and shared by `Arc`; there is no
//! ambient global state. Cancellation is drop-based: dropping a request
//! future detaches it from any in-flight batch without aborting the batch
//! for other callers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod network;
pub mod onion;
pub mod snode;

pub use error::{Error, Result};
pub use network::{Decision, ServerClient, SessionNetwork, SnodeClient, SwarmAuth};
pub use onion::{OnionDestination, OnionError, OnionResponse, OnionVersion};
pub use snode::ServiceNode;

/// Number of hops in an onion path.
pub const PATH_HOP_COUNT: usize = 3;

/// Default namespace for stored messages.
pub const DEFAULT_NAMESPACE: i32 = 0;
