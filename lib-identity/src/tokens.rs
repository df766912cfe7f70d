//! Signed invitation and membership tokens
//!
//! Both token kinds are JSON objects with a detached Ed25519 signature over
//! the canonical form of every other field. Invitations are single-use and
//! expiring; membership tokens are long-lived proof of admission.

use crate::error::TokenError;
use lib_crypto::{signing_bytes, IdentityKeyPair, NodeId, PublicKey};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Protocol version stamped into newly issued tokens.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Hex length of the 128-bit invitation nonce.
const NONCE_HEX_LEN: usize = 32;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn fresh_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A single-use, expiring grant allowing one specific peer to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationToken {
    pub inviter: NodeId,
    pub invitee: NodeId,
    pub timestamp: u64,
    pub expires: u64,
    pub nonce: String,
    pub version: String,
    pub signature: String,
}

impl InvitationToken {
    /// Issue an invitation for `invitee`, valid for `ttl_ms` from now.
    pub fn issue(
        keys: &IdentityKeyPair,
        inviter: NodeId,
        invitee: NodeId,
        ttl_ms: u64,
        version: &str,
    ) -> Self {
        let timestamp = now_ms();
        let mut token = InvitationToken {
            inviter,
            invitee,
            timestamp,
            expires: timestamp + ttl_ms,
            nonce: fresh_nonce(),
            version: version.to_string(),
            signature: String::new(),
        };
        token.signature = keys.sign_hex(&token.to_signing_bytes());
        token
    }

    fn to_signing_bytes(&self) -> Vec<u8> {
        let value = serde_json::to_value(self).unwrap_or_default();
        signing_bytes(&value)
    }

    /// Validate structure, addressee, expiry, and signature.
    ///
    /// Replay protection (the consumed-nonce marker) lives in the identity
    /// service because it needs the DHT.
    pub fn verify(
        &self,
        inviter_key: &PublicKey,
        local: &NodeId,
        now: u64,
    ) -> Result<(), TokenError> {
        if self.nonce.len() != NONCE_HEX_LEN || self.nonce.chars().any(|c| !c.is_ascii_hexdigit())
        {
            return Err(TokenError::Structural("nonce is not 128-bit hex"));
        }
        if self.version.is_empty() {
            return Err(TokenError::Structural("missing version"));
        }
        if self.expires < self.timestamp {
            return Err(TokenError::Structural("expires before issuance"));
        }
        if self.invitee != *local {
            return Err(TokenError::WrongInvitee {
                addressed: self.invitee.to_hex(),
                local: local.to_hex(),
            });
        }
        if now > self.expires {
            return Err(TokenError::Expired {
                expires: self.expires,
                now,
            });
        }
        inviter_key
            .verify(&self.to_signing_bytes(), &self.signature)
            .map_err(|_| TokenError::BadSignature)
    }
}

/// Proof of admission to the mesh. Required to issue invitations.
///
/// A genesis token is self-signed (`issuer == holder`) and only legitimate
/// when the bootstrap has designated this node genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipToken {
    pub holder: NodeId,
    pub issuer: NodeId,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub token_type: String,
    pub is_genesis: bool,
    pub nonce: String,
    pub version: String,
    pub signature: String,
}

impl MembershipToken {
    /// Issue a membership token for `holder`, signed with the holder's key.
    ///
    /// `issuer` records provenance: the inviter for chain members, the holder
    /// itself for genesis.
    pub fn issue(
        keys: &IdentityKeyPair,
        holder: NodeId,
        issuer: NodeId,
        is_genesis: bool,
        version: &str,
    ) -> Result<Self, TokenError> {
        if is_genesis && holder != issuer {
            return Err(TokenError::Structural("genesis token must be self-issued"));
        }
        let mut token = MembershipToken {
            holder,
            issuer,
            timestamp: now_ms(),
            token_type: "membership".to_string(),
            is_genesis,
            nonce: fresh_nonce(),
            version: version.to_string(),
            signature: String::new(),
        };
        token.signature = keys.sign_hex(&token.to_signing_bytes());
        Ok(token)
    }

    fn to_signing_bytes(&self) -> Vec<u8> {
        let value = serde_json::to_value(self).unwrap_or_default();
        signing_bytes(&value)
    }

    /// Validate structure and the holder's signature.
    pub fn verify(&self, holder_key: &PublicKey) -> Result<(), TokenError> {
        if self.token_type != "membership" {
            return Err(TokenError::Structural("wrong token type"));
        }
        if self.is_genesis && self.holder != self.issuer {
            return Err(TokenError::Structural("genesis token must be self-issued"));
        }
        holder_key
            .verify(&self.to_signing_bytes(), &self.signature)
            .map_err(|_| TokenError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_with_id() -> (IdentityKeyPair, NodeId) {
        (IdentityKeyPair::generate(), NodeId::random())
    }

    #[test]
    fn invitation_round_trip_verifies() {
        let (inviter_keys, inviter) = pair_with_id();
        let invitee = NodeId::random();

        let token =
            InvitationToken::issue(&inviter_keys, inviter, invitee, 60_000, PROTOCOL_VERSION);
        token
            .verify(&inviter_keys.public_key(), &invitee, now_ms())
            .unwrap();
    }

    #[test]
    fn invitation_rejects_wrong_invitee() {
        let (inviter_keys, inviter) = pair_with_id();
        let invitee = NodeId::random();
        let bystander = NodeId::random();

        let token =
            InvitationToken::issue(&inviter_keys, inviter, invitee, 60_000, PROTOCOL_VERSION);
        assert!(matches!(
            token.verify(&inviter_keys.public_key(), &bystander, now_ms()),
            Err(TokenError::WrongInvitee { .. })
        ));
    }

    #[test]
    fn invitation_rejects_after_expiry() {
        let (inviter_keys, inviter) = pair_with_id();
        let invitee = NodeId::random();

        let token = InvitationToken::issue(&inviter_keys, inviter, invitee, 10, PROTOCOL_VERSION);
        let later = token.expires + 1;
        assert!(matches!(
            token.verify(&inviter_keys.public_key(), &invitee, later),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn invitation_rejects_field_tampering() {
        let (inviter_keys, inviter) = pair_with_id();
        let invitee = NodeId::random();

        let mut token =
            InvitationToken::issue(&inviter_keys, inviter, invitee, 60_000, PROTOCOL_VERSION);
        token.expires += 3_600_000;
        assert!(matches!(
            token.verify(&inviter_keys.public_key(), &invitee, now_ms()),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn invitation_rejects_wrong_signer() {
        let (inviter_keys, inviter) = pair_with_id();
        let (other_keys, _) = pair_with_id();
        let invitee = NodeId::random();

        let token =
            InvitationToken::issue(&inviter_keys, inviter, invitee, 60_000, PROTOCOL_VERSION);
        assert!(matches!(
            token.verify(&other_keys.public_key(), &invitee, now_ms()),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn membership_round_trip_verifies() {
        let (keys, holder) = pair_with_id();
        let issuer = NodeId::random();

        let token =
            MembershipToken::issue(&keys, holder, issuer, false, PROTOCOL_VERSION).unwrap();
        token.verify(&keys.public_key()).unwrap();
        assert!(!token.is_genesis);
    }

    #[test]
    fn genesis_membership_must_be_self_issued() {
        let (keys, holder) = pair_with_id();
        let someone_else = NodeId::random();

        assert!(MembershipToken::issue(&keys, holder, someone_else, true, PROTOCOL_VERSION)
            .is_err());

        let token = MembershipToken::issue(&keys, holder, holder, true, PROTOCOL_VERSION).unwrap();
        token.verify(&keys.public_key()).unwrap();
        assert!(token.is_genesis);
    }

    #[test]
    fn tokens_serialize_with_wire_field_names() {
        let (keys, holder) = pair_with_id();
        let token = MembershipToken::issue(&keys, holder, holder, true, PROTOCOL_VERSION).unwrap();
        let json = serde_json::to_value(&token).unwrap();

        assert_eq!(json["type"], "membership");
        assert_eq!(json["isGenesis"], true);
        assert!(json["signature"].as_str().is_some());
    }
}
