//! Trellis node library
//!
//! The embeddable surface of the node binary: configuration loading and the
//! [`Peer`] orchestrator that wires identity, the Kademlia engine, the
//! connection fabric, and pub/sub into one lifecycle.

pub mod config;
pub mod peer;

pub use config::NodeConfig;
pub use peer::Peer;
