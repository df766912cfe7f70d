//! Routing contacts
//!
//! A contact is a peer the local node knows about: its identifier, an opaque
//! endpoint string, transport metadata, and liveness bookkeeping. The wire
//! form ([`ContactInfo`]) is what `find_node` responses exchange; the rest is
//! local state.

use lib_crypto::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How many round-trip samples are retained per contact.
const RTT_SAMPLE_WINDOW: usize = 8;

/// Peer runtime class, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Browser,
    Nodejs,
}

/// Transport metadata a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadata {
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub listening_address: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub can_relay: bool,
}

impl PeerMetadata {
    pub fn nodejs(listening_address: Option<String>) -> Self {
        PeerMetadata {
            node_type: NodeType::Nodejs,
            listening_address,
            capabilities: vec!["dht".to_string()],
            can_relay: true,
        }
    }

    pub fn browser() -> Self {
        PeerMetadata {
            node_type: NodeType::Browser,
            listening_address: None,
            capabilities: vec!["dht".to_string()],
            can_relay: false,
        }
    }
}

/// Connection lifecycle as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Failed,
}

/// The wire form of a contact, exchanged in lookup responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub id: NodeId,
    pub endpoint: String,
    pub metadata: PeerMetadata,
}

/// A routing-table entry with liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct Contact {
    pub info: ContactInfo,
    pub last_seen: Instant,
    pub rtt_samples: VecDeque<Duration>,
    pub state: ConnectionState,
    pub failed_attempts: u32,
    /// Inserted to route a signaling reply; dropped if it never connects.
    pub temporary: bool,
    pub inserted_at: Instant,
}

impl Contact {
    pub fn new(info: ContactInfo) -> Self {
        let now = Instant::now();
        Contact {
            info,
            last_seen: now,
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_WINDOW),
            state: ConnectionState::Unknown,
            failed_attempts: 0,
            temporary: false,
            inserted_at: now,
        }
    }

    pub fn temporary(info: ContactInfo) -> Self {
        let mut contact = Contact::new(info);
        contact.temporary = true;
        contact
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    /// Record that the peer was heard from.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failed_attempts = 0;
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        if self.rtt_samples.len() == RTT_SAMPLE_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
        self.touch();
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        Some(total / self.rtt_samples.len() as u32)
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failed_attempts += 1;
        self.failed_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Promote a temporary signaling contact after a real connection opens.
    pub fn promote(&mut self) {
        self.temporary = false;
    }

    pub fn heard_within(&self, window: Duration) -> bool {
        self.last_seen.elapsed() <= window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ContactInfo {
        ContactInfo {
            id: NodeId::random(),
            endpoint: "ws://127.0.0.1:9000".to_string(),
            metadata: PeerMetadata::nodejs(Some("ws://127.0.0.1:9000".to_string())),
        }
    }

    #[test]
    fn touch_clears_failures() {
        let mut contact = Contact::new(info());
        contact.record_failure();
        contact.record_failure();
        assert_eq!(contact.failed_attempts, 2);

        contact.touch();
        assert_eq!(contact.failed_attempts, 0);
    }

    #[test]
    fn rtt_window_is_bounded() {
        let mut contact = Contact::new(info());
        for i in 0..20 {
            contact.record_rtt(Duration::from_millis(10 + i));
        }
        assert_eq!(contact.rtt_samples.len(), RTT_SAMPLE_WINDOW);
        assert!(contact.average_rtt().unwrap() >= Duration::from_millis(10));
    }

    #[test]
    fn temporary_contacts_promote() {
        let mut contact = Contact::temporary(info());
        assert!(contact.temporary);
        contact.promote();
        assert!(!contact.temporary);
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let meta = PeerMetadata::nodejs(Some("ws://h:1".to_string()));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["nodeType"], "nodejs");
        assert_eq!(json["listeningAddress"], "ws://h:1");
        assert_eq!(json["canRelay"], true);
    }
}
