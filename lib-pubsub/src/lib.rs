//! Trellis Sticky Pub/Sub
//!
//! Topic-based publish/subscribe over the DHT: each topic has a single
//! coordinator elected by compare-and-swap on `coordinator:<topic>`, an
//! append-only log of signed messages at `message:<topic>:<seq>`, and a
//! `head:<topic>` high-water mark. Subscribers replay history in order,
//! then receive pushed updates with periodic polling as the fallback.

pub mod coordinator;
pub mod error;
pub mod messages;
pub mod service;

pub use coordinator::elect_coordinator;
pub use error::PubSubError;
pub use messages::{
    coordinator_key, head_key, message_key, CoordinatorRecord, HeadRecord, TopicMessage,
};
pub use service::{JoinOptions, JoinProgress, PubSub};

use std::time::Duration;

/// Pub/sub configuration. Defaults follow the deployed network profile.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Messages coalesced per batch, at most.
    pub batch_size: usize,
    /// How long a batch waits for company.
    pub batch_time: Duration,
    /// Head-polling fallback cadence.
    pub polling_interval: Duration,
    /// Overall budget for a channel join.
    pub join_timeout: Duration,
    /// Join attempts before giving up.
    pub join_max_retries: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        PubSubConfig {
            batch_size: 10,
            batch_time: Duration::from_millis(100),
            polling_interval: Duration::from_secs(5),
            join_timeout: Duration::from_secs(30),
            join_max_retries: 5,
        }
    }
}
