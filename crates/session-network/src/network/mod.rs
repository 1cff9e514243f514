//! Request orchestration: retry loops, failure classification, signed
//! parameter construction, micro-batching and the public client surface.
//!
//! [`SessionNetwork`] owns the inner path-level retry loop.
//! [`SnodeClient`] layers a bounded outer retry with backoff, the batching
//! stage and the typed snode operations on top of it; [`ServerClient`]
//! does the same for HTTPS server destinations.

mod auth;
mod batch;
mod classify;
mod ons;
mod server_client;
mod session_network;
mod snode_client;

pub use auth::{KeyPairAuth, SwarmAuth, TtlChange};
pub use batch::{BatchDispatcher, BatchExecutor, BatchKey, ExecutionMode, SubRequest, SubResponse};
pub use classify::{Decision, FailureHandler};
pub use server_client::{NetworkTimeSource, ServerClient, ServerRequest};
pub use session_network::{SessionNetwork, MAX_PATH_ATTEMPTS};
pub use snode_client::{RetrievedMessage, SnodeClient, StoreResult};
