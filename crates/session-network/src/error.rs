//! Error types for the network core.
//!
//! One crate-level error enum; classifiers never construct these directly
//! for control flow — they return a [`Decision`](crate::network::Decision)
//! and only terminal failures are surfaced to callers.

use thiserror::Error;

/// Core error type for network operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The snode pool has never been populated.
    #[error("snode pool is empty")]
    EmptyPool,

    /// Not enough usable nodes in the pool to build a path.
    #[error("insufficient snodes for path ({available} available)")]
    InsufficientNodes {
        /// Usable nodes currently in the pool.
        available: usize,
    },

    /// A swarm could not be fetched for an account.
    #[error("swarm fetch failed")]
    SwarmFetch(String),

    /// The network could not be reached after exhausting retries.
    #[error("network unreachable")]
    Unreachable {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The destination returned an application-level error status.
    #[error("destination returned status {status}")]
    Destination {
        /// HTTP status surfaced from the destination.
        status: u16,
        /// Response body, when one was returned.
        body: Option<String>,
    },

    /// Our clock disagrees with the network; a resync is required before
    /// the request can be rebuilt and retried.
    #[error("clock out of sync with network")]
    ClockOutOfSync,

    /// Independent lookups disagreed; the result cannot be trusted.
    #[error("validation failed")]
    Validation(String),

    /// A response could not be parsed.
    #[error("invalid response")]
    InvalidResponse(String),

    /// Request signing failed.
    #[error("signing failed")]
    Signing(String),

    /// Cryptographic operation failed.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Encoding or decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Local cache storage error.
    #[error("storage error")]
    Storage(String),

    /// HTTP client construction or dispatch error.
    #[error("http client error")]
    Http(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The batching stage refused the request under backpressure.
    #[error("batch queue full")]
    BatchQueueFull,

    /// A batch response carried fewer results than requests.
    #[error("batch response was short")]
    ShortBatch,

    /// An internal worker went away before answering.
    #[error("worker shut down")]
    Shutdown,
}

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl Error {
    /// Whether the outer retry loop may try this request again.
    ///
    /// Application-level failures (bad request, validation mismatch) are
    /// terminal; transport exhaustion and short batches are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. } | Error::Timeout | Error::ShortBatch | Error::Shutdown
        )
    }
}
