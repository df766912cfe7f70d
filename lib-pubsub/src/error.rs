//! Pub/sub error taxonomy

use lib_dht::DhtError;
use thiserror::Error;

/// Failures surfaced by the pub/sub layer.
///
/// CAS conflicts resolve by re-reading and are not errors; what surfaces
/// here is what the caller must act on.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("topic name {0:?} is invalid")]
    InvalidTopic(String),

    #[error("no coordinator could be established for topic {0}")]
    NoCoordinator(String),

    #[error("join of topic {topic} timed out after {attempts} attempts; {hint}")]
    JoinTimeout {
        topic: String,
        attempts: u32,
        hint: &'static str,
    },

    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),

    #[error("publish to topic {0} was not acknowledged")]
    PublishFailed(String),

    #[error(transparent)]
    Dht(#[from] DhtError),
}
