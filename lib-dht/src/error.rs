//! Engine error taxonomy

use lib_crypto::NodeId;
use thiserror::Error;

/// Failures surfaced by the Kademlia engine.
///
/// Lookup and storage failures bubble up as `NotFound`/`StoreFailed`; the
/// engine does not retry at this layer. `SelfRequest` is a programming
/// error, not a network condition.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("request {request_id} timed out")]
    Timeout { request_id: String },

    #[error("no connected contacts to query")]
    NoConnectedContacts,

    #[error("store failed on every replica for key {key}")]
    StoreFailed { key: String },

    #[error("value not found for key {key}")]
    NotFound { key: String },

    #[error("peer {peer} is not connected")]
    Disconnected { peer: NodeId },

    #[error("attempted to send a request to the local node")]
    SelfRequest,

    #[error("unexpected response type for request {request_id}")]
    UnexpectedResponse { request_id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("send failed: {0}")]
    Send(#[from] anyhow::Error),
}
