//! Trellis Kademlia Engine
//!
//! The routing core of the overlay: 160-bit XOR routing over k-buckets,
//! iterative `find_node`/`find_value`, replicated `store` with a CAS
//! variant for coordinator records, a request/response correlator, and the
//! background maintenance loops (adaptive refresh, republish, expiration,
//! liveness pings).
//!
//! The engine is transport-agnostic: outbound traffic goes through the
//! [`PeerSender`] contract implemented by the connection fabric.

pub mod contact;
pub mod engine;
pub mod error;
pub mod kbucket;
pub mod maintenance;
pub mod pending;
pub mod routing_table;
pub mod store;
pub mod wire;

pub use contact::{ConnectionState, Contact, ContactInfo, NodeType, PeerMetadata};
pub use engine::{CasOutcome, DhtEngine, PeerSender};
pub use error::DhtError;
pub use kbucket::{InsertOutcome, KBucket};
pub use maintenance::spawn_maintenance;
pub use pending::PendingRequests;
pub use routing_table::{RoutingStats, RoutingTable};
pub use store::{LocalStore, StoredValue};
pub use wire::{Envelope, Payload};

use std::time::Duration;

/// Bucket capacity and lookup breadth.
pub const K: usize = 20;

/// Lookup concurrency.
pub const ALPHA: usize = 3;

/// Replication factor for `store`.
pub const REPLICATE_K: usize = 3;

/// Engine configuration. Defaults follow the deployed network profile.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity and lookup breadth.
    pub k: usize,
    /// Concurrent RPCs per lookup round.
    pub alpha: usize,
    /// Replication factor for `store`.
    pub replicate_k: usize,
    /// Base refresh tick in the medium regime.
    pub refresh_interval: Duration,
    /// Refresh tick under low connectivity.
    pub aggressive_refresh_interval: Duration,
    /// Refresh tick in steady state.
    pub standard_refresh_interval: Duration,
    /// Republish cadence for locally stored values.
    pub republish_interval: Duration,
    /// Local value TTL.
    pub expire_interval: Duration,
    /// Liveness ping cadence.
    pub ping_interval: Duration,
    /// Minimum spacing of `find_node` requests to one peer.
    pub find_node_min_interval: Duration,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Consecutive failures before a contact is evicted.
    pub peer_failure_threshold: u32,
    /// Silent period after eviction.
    pub peer_backoff_duration: Duration,
    /// Lifetime of a temporary signaling contact that never connects.
    pub temporary_contact_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            k: K,
            alpha: ALPHA,
            replicate_k: REPLICATE_K,
            refresh_interval: Duration::from_secs(60),
            aggressive_refresh_interval: Duration::from_secs(15),
            standard_refresh_interval: Duration::from_secs(600),
            republish_interval: Duration::from_secs(24 * 60 * 60),
            expire_interval: Duration::from_secs(24 * 60 * 60),
            ping_interval: Duration::from_secs(60),
            find_node_min_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            peer_failure_threshold: 3,
            peer_backoff_duration: Duration::from_secs(5 * 60),
            temporary_contact_ttl: Duration::from_secs(2 * 60),
        }
    }
}

impl DhtConfig {
    /// Reject configurations that cannot route.
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be positive"));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(DhtError::InvalidConfig("alpha must be in 1..=k"));
        }
        if self.replicate_k == 0 {
            return Err(DhtError::InvalidConfig("replicate_k must be positive"));
        }
        if self.request_timeout.is_zero() || self.refresh_interval.is_zero() {
            return Err(DhtError::InvalidConfig("timeouts must be positive"));
        }
        Ok(())
    }
}
