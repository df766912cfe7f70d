//! Fabric error taxonomy

use lib_crypto::NodeId;
use thiserror::Error;

/// Transport and protocol failures surfaced by the connection fabric.
///
/// Transport errors close the connection and mark the peer failed. Unknown
/// message types are logged and ignored for forward compatibility; a version
/// mismatch is fatal to the session.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("peer {0} disconnected")]
    PeerDisconnected(NodeId),

    #[error("no connection to peer {0}")]
    NotConnected(NodeId),

    #[error("no route toward peer {0}")]
    NoRoute(NodeId),

    #[error("message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    MalformedJson(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(String),

    #[error("protocol version mismatch: server {server_version}: {message}")]
    VersionMismatch {
        server_version: String,
        message: String,
    },

    #[error("transport failure: {0}")]
    Transport(String),
}
