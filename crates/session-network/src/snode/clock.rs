//! Network-adjusted logical clock.
//!
//! Service nodes reject timestamp-signed requests when the client's clock
//! drifts too far. This clock keeps a snapshot of network time paired with
//! a monotonic instant, so `now_ms` is immune to wall-clock jumps and is
//! non-decreasing between resyncs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::debug;

/// A single resync sample. Replaced atomically as a whole; readers never
/// observe a torn state.
#[derive(Debug, Clone, Copy)]
struct ClockSnapshot {
    network_ms: u64,
    sampled: Instant,
}

/// Network-adjusted clock, resynced against a random service node.
#[derive(Default)]
pub struct NetworkClock {
    snapshot: RwLock<Option<ClockSnapshot>>,
    stale: AtomicBool,
}

impl NetworkClock {
    /// Create an unsynced clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current network-adjusted epoch milliseconds.
    ///
    /// Falls back to system time when the clock has never been synced.
    pub async fn now_ms(&self) -> u64 {
        match *self.snapshot.read().await {
            Some(snapshot) => {
                let elapsed = snapshot.sampled.elapsed().as_millis() as u64;
                snapshot.network_ms + elapsed
            }
            None => system_time_ms(),
        }
    }

    /// Record a fresh network time sample and clear the stale flag.
    pub async fn update(&self, network_ms: u64) {
        let mut snapshot = self.snapshot.write().await;
        *snapshot = Some(ClockSnapshot {
            network_ms,
            sampled: Instant::now(),
        });
        self.stale.store(false, Ordering::Release);
        debug!("network clock resynced to {network_ms}");
    }

    /// Flag the clock as out of sync with the network.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Whether a resync should happen before the next signed request.
    pub fn needs_sync(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Whether the clock has ever been synced.
    pub async fn is_synced(&self) -> bool {
        self.snapshot.read().await.is_some()
    }
}

fn system_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
