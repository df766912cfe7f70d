//! Bootstrap wire contract
//!
//! The rendezvous protocol spoken with the bootstrap service: registration
//! with version negotiation, peer lists or a genesis designation, opaque
//! signal relay, invitation delivery, and the independence announcement.
//! JSON with a snake_case `type` tag and camelCase fields, interoperable
//! with deployed bootstrap servers.

use lib_crypto::NodeId;
use lib_dht::{NodeType, PeerMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registration metadata describing what this peer can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMetadata {
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub listening_address: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub can_accept_connections: bool,
    pub can_initiate_connections: bool,
}

/// A peer as the bootstrap announces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPeer {
    pub node_id: NodeId,
    pub metadata: PeerMetadata,
}

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BootstrapClientMessage {
    Register {
        node_id: NodeId,
        public_key: String,
        protocol_version: String,
        build_id: String,
        metadata: RegisterMetadata,
    },
    RequestPeers {
        k: usize,
    },
    ForwardSignal {
        target_peer: NodeId,
        signal: Value,
    },
    SendInvitation {
        target_peer: NodeId,
        invitation_token: Value,
    },
    PeerLookup {
        target_peer: NodeId,
    },
    JoinPeer {
        target_peer: NodeId,
    },
    AnnounceIndependent,
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BootstrapServerMessage {
    Registered {
        build_id: String,
    },
    PeerList {
        peers: Vec<BootstrapPeer>,
    },
    /// Authorizes a self-signed genesis membership token.
    GenesisDesignation,
    Signal {
        from_peer: NodeId,
        signal: Value,
    },
    InvitationReceived {
        from_peer: NodeId,
        invitation_token: Value,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        websocket_coordination: Option<Value>,
    },
    PeerAvailable {
        target_peer_id: NodeId,
    },
    /// Fatal to the session; surfaced as "refresh required".
    VersionMismatch {
        server_version: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_uses_wire_names() {
        let msg = BootstrapClientMessage::Register {
            node_id: NodeId::from_key("n"),
            public_key: "aa".to_string(),
            protocol_version: "1.0.0".to_string(),
            build_id: "node_ff00".to_string(),
            metadata: RegisterMetadata {
                node_type: NodeType::Nodejs,
                listening_address: Some("ws://10.0.0.5:9000".to_string()),
                capabilities: vec!["dht".to_string()],
                can_accept_connections: true,
                can_initiate_connections: true,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "register");
        assert_eq!(value["protocolVersion"], "1.0.0");
        assert_eq!(value["metadata"]["nodeType"], "nodejs");
        assert_eq!(value["metadata"]["canAcceptConnections"], true);
    }

    #[test]
    fn server_messages_round_trip() {
        let messages = vec![
            BootstrapServerMessage::Registered {
                build_id: "node_1".to_string(),
            },
            BootstrapServerMessage::GenesisDesignation,
            BootstrapServerMessage::Signal {
                from_peer: NodeId::from_key("p"),
                signal: json!({"sdp": "v=0"}),
            },
            BootstrapServerMessage::VersionMismatch {
                server_version: "1.0.0".to_string(),
                message: "refresh required".to_string(),
            },
        ];
        for msg in messages {
            let text = serde_json::to_string(&msg).unwrap();
            let back: BootstrapServerMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn genesis_designation_is_a_bare_tag() {
        let text = serde_json::to_string(&BootstrapServerMessage::GenesisDesignation).unwrap();
        assert_eq!(text, r#"{"type":"genesis_designation"}"#);
    }

    #[test]
    fn invitation_parses_with_and_without_coordination() {
        let with: BootstrapServerMessage = serde_json::from_value(json!({
            "type": "invitation_received",
            "fromPeer": NodeId::from_key("a"),
            "invitationToken": {"nonce": "x"},
            "websocketCoordination": {"address": "ws://h:1"},
        }))
        .unwrap();
        assert!(matches!(
            with,
            BootstrapServerMessage::InvitationReceived {
                websocket_coordination: Some(_),
                ..
            }
        ));

        let without: BootstrapServerMessage = serde_json::from_value(json!({
            "type": "invitation_received",
            "fromPeer": NodeId::from_key("a"),
            "invitationToken": {"nonce": "x"},
        }))
        .unwrap();
        assert!(matches!(
            without,
            BootstrapServerMessage::InvitationReceived {
                websocket_coordination: None,
                ..
            }
        ));
    }
}
