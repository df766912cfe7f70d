//! Peer wire protocol
//!
//! Every peer-to-peer message is a JSON object with a snake_case `type` tag
//! and camelCase fields, wrapped in an envelope carrying sender, optional
//! target, and a timestamp. The tagged union covers Kademlia RPC, overlay
//! signaling, and the pub/sub messages; the compiler enforces exhaustive
//! handling everywhere a message is dispatched.

use crate::contact::{ContactInfo, NodeType};
use crate::store::now_ms;
use lib_crypto::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message envelope. `target_peer` is present on routed signaling messages;
/// direct RPC leaves it implicit in the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub sender_peer: NodeId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_peer: Option<NodeId>,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(sender: NodeId, target: Option<NodeId>, payload: Payload) -> Self {
        Envelope {
            sender_peer: sender,
            target_peer: target,
            timestamp: now_ms(),
            payload,
        }
    }
}

/// The closed set of peer message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Payload {
    // Kademlia RPC.
    Ping {
        request_id: String,
    },
    Pong {
        request_id: String,
    },
    FindNode {
        request_id: String,
        target: NodeId,
    },
    FindNodeResponse {
        request_id: String,
        nodes: Vec<ContactInfo>,
    },
    FindValue {
        request_id: String,
        key: String,
    },
    FindValueResponse {
        request_id: String,
        found: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        nodes: Option<Vec<ContactInfo>>,
    },
    Store {
        request_id: String,
        key: String,
        value: Value,
    },
    StoreResponse {
        request_id: String,
        success: bool,
    },
    CasStore {
        request_id: String,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        expected_version: Option<u64>,
        value: Value,
    },
    CasStoreResponse {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        current: Option<Value>,
    },

    // Overlay signaling.
    WebrtcOffer {
        sdp: String,
    },
    WebrtcAnswer {
        sdp: String,
    },
    WebrtcIce {
        candidate: Value,
    },
    WebsocketConnectionRequest {
        node_type: NodeType,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        listening_address: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        can_relay: bool,
    },
    WebsocketConnectionResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        node_type: NodeType,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        listening_address: Option<String>,
    },
    PeerDiscoveryRequest {
        request_id: String,
        count: usize,
    },
    PeerDiscoveryResponse {
        request_id: String,
        peers: Vec<ContactInfo>,
    },

    // Pub/sub.
    Publish {
        request_id: String,
        topic: String,
        message: Value,
    },
    PublishAck {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        seq: Option<u64>,
    },
    Subscribe {
        request_id: String,
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        last_seen_seq: Option<u64>,
    },
    SubscribeAck {
        request_id: String,
        topic: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        head: Option<u64>,
    },
    CoordinatorClaim {
        topic: String,
        record: Value,
    },
    HeadUpdate {
        topic: String,
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<Value>,
    },
}

impl Payload {
    /// The wire tag, for logs and dedup fingerprints.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Ping { .. } => "ping",
            Payload::Pong { .. } => "pong",
            Payload::FindNode { .. } => "find_node",
            Payload::FindNodeResponse { .. } => "find_node_response",
            Payload::FindValue { .. } => "find_value",
            Payload::FindValueResponse { .. } => "find_value_response",
            Payload::Store { .. } => "store",
            Payload::StoreResponse { .. } => "store_response",
            Payload::CasStore { .. } => "cas_store",
            Payload::CasStoreResponse { .. } => "cas_store_response",
            Payload::WebrtcOffer { .. } => "webrtc_offer",
            Payload::WebrtcAnswer { .. } => "webrtc_answer",
            Payload::WebrtcIce { .. } => "webrtc_ice",
            Payload::WebsocketConnectionRequest { .. } => "websocket_connection_request",
            Payload::WebsocketConnectionResponse { .. } => "websocket_connection_response",
            Payload::PeerDiscoveryRequest { .. } => "peer_discovery_request",
            Payload::PeerDiscoveryResponse { .. } => "peer_discovery_response",
            Payload::Publish { .. } => "publish",
            Payload::PublishAck { .. } => "publish_ack",
            Payload::Subscribe { .. } => "subscribe",
            Payload::SubscribeAck { .. } => "subscribe_ack",
            Payload::CoordinatorClaim { .. } => "coordinator_claim",
            Payload::HeadUpdate { .. } => "head_update",
        }
    }

    /// Correlation id, where the message carries one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Payload::Ping { request_id }
            | Payload::Pong { request_id }
            | Payload::FindNode { request_id, .. }
            | Payload::FindNodeResponse { request_id, .. }
            | Payload::FindValue { request_id, .. }
            | Payload::FindValueResponse { request_id, .. }
            | Payload::Store { request_id, .. }
            | Payload::StoreResponse { request_id, .. }
            | Payload::CasStore { request_id, .. }
            | Payload::CasStoreResponse { request_id, .. }
            | Payload::PeerDiscoveryRequest { request_id, .. }
            | Payload::PeerDiscoveryResponse { request_id, .. }
            | Payload::Publish { request_id, .. }
            | Payload::PublishAck { request_id, .. }
            | Payload::Subscribe { request_id, .. }
            | Payload::SubscribeAck { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// True for the response half of a request/response pair.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::Pong { .. }
                | Payload::FindNodeResponse { .. }
                | Payload::FindValueResponse { .. }
                | Payload::StoreResponse { .. }
                | Payload::CasStoreResponse { .. }
                | Payload::PeerDiscoveryResponse { .. }
                | Payload::PublishAck { .. }
                | Payload::SubscribeAck { .. }
        )
    }

    /// True for messages the overlay may forward toward their target.
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Payload::WebrtcOffer { .. }
                | Payload::WebrtcAnswer { .. }
                | Payload::WebrtcIce { .. }
                | Payload::WebsocketConnectionRequest { .. }
                | Payload::WebsocketConnectionResponse { .. }
                | Payload::PeerDiscoveryRequest { .. }
                | Payload::PeerDiscoveryResponse { .. }
        )
    }

    /// True for messages the overlay may forward toward their target:
    /// signaling, plus the pub/sub traffic that reaches a coordinator over
    /// greedy routing when no direct link exists.
    pub fn is_routable(&self) -> bool {
        self.is_signaling()
            || matches!(
                self,
                Payload::Publish { .. }
                    | Payload::PublishAck { .. }
                    | Payload::Subscribe { .. }
                    | Payload::SubscribeAck { .. }
                    | Payload::CoordinatorClaim { .. }
                    | Payload::HeadUpdate { .. }
            )
    }

    /// Type-specific identifying fields for the duplicate-suppression
    /// fingerprint: enough to tell two distinct messages of the same type
    /// apart without hashing whole bodies.
    pub fn dedup_discriminator(&self) -> String {
        if let Some(request_id) = self.request_id() {
            return request_id.to_string();
        }
        match self {
            Payload::WebrtcOffer { sdp } | Payload::WebrtcAnswer { sdp } => {
                sdp.chars().take(32).collect()
            }
            Payload::WebrtcIce { candidate } => candidate.to_string(),
            Payload::CoordinatorClaim { topic, .. } => topic.clone(),
            Payload::HeadUpdate { topic, seq, .. } => format!("{topic}:{seq}"),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(payload: Payload) -> Envelope {
        Envelope::new(NodeId::random(), Some(NodeId::random()), payload)
    }

    #[test]
    fn messages_round_trip_as_json() {
        let messages = vec![
            Payload::Ping {
                request_id: "ab12cd34_1".to_string(),
            },
            Payload::FindNode {
                request_id: "ab12cd34_2".to_string(),
                target: NodeId::random(),
            },
            Payload::FindValueResponse {
                request_id: "ab12cd34_3".to_string(),
                found: true,
                value: Some(json!({"x": 1})),
                nodes: None,
            },
            Payload::CasStore {
                request_id: "ab12cd34_4".to_string(),
                key: "coordinator:chat".to_string(),
                expected_version: Some(3),
                value: json!({"version": 4}),
            },
            Payload::WebsocketConnectionRequest {
                node_type: NodeType::Nodejs,
                listening_address: Some("ws://10.0.0.1:9000".to_string()),
                capabilities: vec!["dht".to_string()],
                can_relay: true,
            },
            Payload::HeadUpdate {
                topic: "chat".to_string(),
                seq: 7,
                message: None,
            },
        ];

        for payload in messages {
            let env = envelope(payload.clone());
            let text = serde_json::to_string(&env).unwrap();
            let back: Envelope = serde_json::from_str(&text).unwrap();
            assert_eq!(back.payload, payload);
        }
    }

    #[test]
    fn wire_uses_snake_case_tags_and_camel_case_fields() {
        let env = envelope(Payload::FindNode {
            request_id: "ab12cd34_9".to_string(),
            target: NodeId::from_key("t"),
        });
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["type"], "find_node");
        assert!(value["requestId"].is_string());
        assert!(value["senderPeer"].is_string());
        assert!(value["targetPeer"].is_string());
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = json!({
            "type": "future_feature",
            "senderPeer": NodeId::random(),
            "timestamp": 1u64,
        });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn request_id_extraction_matches_tag_kind() {
        let ping = Payload::Ping {
            request_id: "aa_1".to_string(),
        };
        assert_eq!(ping.request_id(), Some("aa_1"));
        assert!(!ping.is_response());

        let pong = Payload::Pong {
            request_id: "aa_1".to_string(),
        };
        assert!(pong.is_response());

        let offer = Payload::WebrtcOffer {
            sdp: "v=0".to_string(),
        };
        assert_eq!(offer.request_id(), None);
        assert!(offer.is_signaling());
    }
}
