//! Topic records
//!
//! The three record shapes a topic keeps in the DHT: the coordinator claim
//! (versioned for CAS), the signed log entries, and the head high-water
//! mark. Field names match the wire precisely, including the `ID`
//! capitalization the deployed network uses.
//!
//! A publisher signs a message before the coordinator assigns its sequence
//! number, so the signature covers publisher, data, and timestamp; the
//! `seq` and `signature` fields are stripped from the signing input.

use lib_crypto::{signing_bytes, IdentityKeyPair, NodeId, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DHT key of the coordinator record for `topic`.
pub fn coordinator_key(topic: &str) -> String {
    format!("coordinator:{topic}")
}

/// DHT key of log entry `seq` of `topic`.
pub fn message_key(topic: &str, seq: u64) -> String {
    format!("message:{topic}:{seq}")
}

/// DHT key of the head marker for `topic`.
pub fn head_key(topic: &str) -> String {
    format!("head:{topic}")
}

/// The coordinator claim stored at `coordinator:<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub version: u64,
    #[serde(rename = "issuedAt")]
    pub issued_at: u64,
}

/// The head marker stored at `head:<topic>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadRecord {
    pub seq: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
}

/// One entry of a topic log, stored at `message:<topic>:<seq>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    #[serde(rename = "publisherID")]
    pub publisher_id: NodeId,
    pub data: Value,
    pub timestamp: u64,
    pub seq: u64,
    pub signature: String,
}

impl TopicMessage {
    /// Build and sign a message. The sequence number is assigned later by
    /// the coordinator and is not covered by the signature.
    pub fn signed(keys: &IdentityKeyPair, publisher_id: NodeId, data: Value, timestamp: u64) -> Self {
        let mut message = TopicMessage {
            publisher_id,
            data,
            timestamp,
            seq: 0,
            signature: String::new(),
        };
        message.signature = keys.sign_hex(&message.signing_input());
        message
    }

    fn signing_input(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.remove("seq");
            object.remove("signature");
        }
        signing_bytes(&value)
    }

    /// Verify the publisher's signature.
    pub fn verify(&self, publisher_key: &PublicKey) -> bool {
        publisher_key
            .verify(&self.signing_input(), &self.signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_shapes_match_the_wire() {
        assert_eq!(coordinator_key("chat"), "coordinator:chat");
        assert_eq!(message_key("chat", 3), "message:chat:3");
        assert_eq!(head_key("chat"), "head:chat");
    }

    #[test]
    fn records_use_wire_field_names() {
        let record = CoordinatorRecord {
            node_id: NodeId::from_key("c"),
            version: 2,
            issued_at: 5,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("nodeID").is_some());
        assert!(value.get("issuedAt").is_some());

        let message = TopicMessage {
            publisher_id: NodeId::from_key("p"),
            data: json!({"text": "m1"}),
            timestamp: 1,
            seq: 0,
            signature: "00".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("publisherID").is_some());
    }

    #[test]
    fn signature_survives_seq_assignment() {
        let keys = IdentityKeyPair::generate();
        let publisher = NodeId::random();
        let mut message = TopicMessage::signed(&keys, publisher, json!({"text": "m1"}), 42);

        assert!(message.verify(&keys.public_key()));

        // The coordinator stamps the sequence; the signature still holds.
        message.seq = 17;
        assert!(message.verify(&keys.public_key()));
    }

    #[test]
    fn tampered_data_fails_verification() {
        let keys = IdentityKeyPair::generate();
        let mut message =
            TopicMessage::signed(&keys, NodeId::random(), json!({"text": "m1"}), 42);
        message.data = json!({"text": "forged"});
        assert!(!message.verify(&keys.public_key()));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keys = IdentityKeyPair::generate();
        let message = TopicMessage::signed(&keys, NodeId::random(), json!({"x": 1}), 42);
        assert!(!message.verify(&IdentityKeyPair::generate().public_key()));
    }
}
