//! Trellis Connection Fabric
//!
//! One "send a message to a peer" surface over heterogeneous links. The
//! fabric picks the transport from the peer-type matrix, performs signaling
//! (bootstrap rendezvous first, DHT overlay once the mesh exists), enforces
//! ordered per-peer delivery, deduplicates the forwarded and direct paths,
//! and reports connection lifecycle events upward.
//!
//! This node runs as a `nodejs`-type peer: it operates WebSocket listeners,
//! which browsers cannot. Browser-to-browser WebRTC traffic crosses this
//! node only as signaling (offer/answer/ICE relay); the perfect-negotiation
//! state machine lives in [`negotiation`] as pure protocol logic.

pub mod bootstrap;
pub mod dedup;
pub mod error;
pub mod fabric;
pub mod inbox;
pub mod matrix;
pub mod messages;
pub mod negotiation;
pub mod testing;
pub mod transport;
pub mod version;

pub use bootstrap::{BootstrapClient, BootstrapEvent};
pub use dedup::DedupCache;
pub use error::MeshError;
pub use fabric::{ConnectionFabric, FabricEvent};
pub use inbox::PeerInbox;
pub use matrix::{choose_transport, TransportChoice};
pub use messages::{BootstrapClientMessage, BootstrapPeer, BootstrapServerMessage, RegisterMetadata};
pub use negotiation::{NegotiationAction, PerfectNegotiation};
pub use transport::{LinkKind, TransportLink};
pub use version::{ProtocolVersion, BUILD_ID_NODE_PREFIX, MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION};

use std::time::Duration;

/// Fabric configuration. Defaults follow the deployed network profile.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Per-peer inbox TTL; older messages are discarded at dequeue.
    pub message_timeout: Duration,
    /// Per-peer inbox cap; the oldest entries drop past it.
    pub max_queue_size: usize,
    /// Signaling dedup fingerprint TTL.
    pub message_deduplication_timeout: Duration,
    /// Reverse-dial request lifetime.
    pub pending_dial_timeout: Duration,
    /// Upper bound on a single wire frame.
    pub max_message_bytes: usize,
    /// Grace period on the bootstrap link after the first mesh connection.
    pub bootstrap_grace: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            message_timeout: Duration::from_secs(30),
            max_queue_size: 100,
            message_deduplication_timeout: Duration::from_secs(60),
            pending_dial_timeout: Duration::from_secs(30),
            max_message_bytes: 256 * 1024,
            bootstrap_grace: Duration::from_secs(10),
        }
    }
}
