//! Runtime configuration for a [`crate::Node`].
//!
//! These are in-process constructor knobs, not a file format — reading
//! configuration off disk remains an external collaborator's job.

use std::time::Duration;

/// Tunable timers and capacities for a running node.
///
/// The defaults match the timeout table used throughout the component
/// design: a 30s announce cadence, a 60s gc sweep, a 5 minute peer
/// eviction window, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Maximum encoded packet size before fragmentation is required,
    /// mirroring a single GATT write's practical payload budget.
    pub mtu_budget: usize,
    /// How often to broadcast an `ANNOUNCE` packet.
    pub announce_interval: Duration,
    /// How often to run the dedup/peer/store-and-forward GC sweep.
    pub gc_interval: Duration,
    /// How long a peer may go unseen before it is evicted from the
    /// peer table.
    pub peer_eviction: Duration,
    /// How long a dedup entry is retained before GC drops it.
    pub dedup_retention: Duration,
    /// Maximum number of entries held in the dedup set (LRU-evicted
    /// beyond this).
    pub dedup_capacity: usize,
    /// How long an incomplete fragment reassembly buffer lives before
    /// it is discarded.
    pub fragment_timeout: Duration,
    /// Per-peer cap on fragment reassembly memory, in bytes.
    pub fragment_cap_per_peer: usize,
    /// Retention for the regular store-and-forward queue.
    pub store_forward_retention: Duration,
    /// Retention for the favorites store-and-forward queue.
    pub favorites_retention: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mtu_budget: 512,
            announce_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(60),
            peer_eviction: Duration::from_secs(5 * 60),
            dedup_retention: Duration::from_secs(10 * 60),
            dedup_capacity: 10_000,
            fragment_timeout: Duration::from_secs(60),
            fragment_cap_per_peer: 4 * 64 * 1024,
            store_forward_retention: Duration::from_secs(12 * 60 * 60),
            favorites_retention: Duration::from_secs(168 * 60 * 60),
        }
    }
}
