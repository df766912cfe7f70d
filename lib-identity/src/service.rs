//! Identity service
//!
//! Owns the device key pair and membership state, issues and accepts tokens,
//! and publishes trust material through the DHT. The DHT itself is reached
//! through the [`TrustStore`] contract; the engine crate implements it.

use crate::error::{IdentityError, TokenError};
use crate::tokens::{now_ms, InvitationToken, MembershipToken};
use async_trait::async_trait;
use lib_crypto::{IdentityKeyPair, NodeId, PublicKey};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Well-known key for a node's published verifying key.
pub fn public_key_key(node_id: &NodeId) -> String {
    format!("public_key:{}", node_id.to_hex())
}

/// Well-known key for a consumed invitation nonce.
pub fn consumed_token_key(nonce: &str) -> String {
    format!("consumed_token:{nonce}")
}

/// Replicated key-value storage used for trust material: published public
/// keys and consumed-nonce markers.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Returns whether at least one replica accepted the write.
    async fn put(&self, key: &str, value: Value) -> anyhow::Result<bool>;
}

/// Per-device identity: key pair, node id, membership state.
///
/// Genesis authorization and the membership token are once-only values set
/// during start-up flows; they never revert.
pub struct IdentityService {
    node_id: NodeId,
    keys: IdentityKeyPair,
    version: String,
    membership: RwLock<Option<MembershipToken>>,
    genesis_authorized: AtomicBool,
}

impl IdentityService {
    pub fn new(node_id: NodeId, keys: IdentityKeyPair, version: &str) -> Self {
        IdentityService {
            node_id,
            keys,
            version: version.to_string(),
            membership: RwLock::new(None),
            genesis_authorized: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// The signing key pair, for layers that sign their own payloads.
    pub fn key_pair(&self) -> &IdentityKeyPair {
        &self.keys
    }

    /// Sign arbitrary bytes with the device key. Used by the pub/sub layer
    /// for topic messages.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        self.keys.sign_hex(message)
    }

    pub fn membership(&self) -> Option<MembershipToken> {
        self.membership.read().clone()
    }

    pub fn is_member(&self) -> bool {
        self.membership.read().is_some()
    }

    /// Record the bootstrap's genesis designation. Without this,
    /// [`IdentityService::become_genesis`] refuses.
    pub fn authorize_genesis(&self) {
        self.genesis_authorized.store(true, Ordering::SeqCst);
    }

    /// Self-issue the genesis membership token.
    pub fn become_genesis(&self) -> Result<MembershipToken, TokenError> {
        if !self.genesis_authorized.load(Ordering::SeqCst) {
            return Err(TokenError::IllegalGenesis);
        }
        let token =
            MembershipToken::issue(&self.keys, self.node_id, self.node_id, true, &self.version)?;
        *self.membership.write() = Some(token.clone());
        info!(node = %self.node_id.short(), "assumed genesis membership");
        Ok(token)
    }

    /// Issue an invitation for `invitee`. Requires a held membership token.
    pub fn create_invitation(
        &self,
        invitee: NodeId,
        ttl_ms: u64,
    ) -> Result<InvitationToken, TokenError> {
        if !self.is_member() {
            return Err(TokenError::MembershipRequired);
        }
        let token =
            InvitationToken::issue(&self.keys, self.node_id, invitee, ttl_ms, &self.version);
        info!(
            invitee = %invitee.short(),
            nonce = %token.nonce,
            "issued invitation"
        );
        Ok(token)
    }

    /// Accept an invitation addressed to this node: verify it, burn the
    /// nonce in the DHT, and mint our membership token.
    pub async fn accept_invitation(
        &self,
        token: &InvitationToken,
        inviter_key: &PublicKey,
        trust: &dyn TrustStore,
    ) -> Result<MembershipToken, IdentityError> {
        token.verify(inviter_key, &self.node_id, now_ms())?;

        let marker_key = consumed_token_key(&token.nonce);
        if trust.get(&marker_key).await?.is_some() {
            warn!(nonce = %token.nonce, "invitation replay rejected");
            return Err(TokenError::Replayed.into());
        }
        trust
            .put(
                &marker_key,
                json!({
                    "inviter": token.inviter,
                    "invitee": token.invitee,
                    "consumedAt": now_ms(),
                }),
            )
            .await?;

        let membership =
            MembershipToken::issue(&self.keys, self.node_id, token.inviter, false, &self.version)?;
        *self.membership.write() = Some(membership.clone());
        info!(inviter = %token.inviter.short(), "joined via invitation");
        Ok(membership)
    }

    /// Publish this node's verifying key under its well-known DHT key.
    pub async fn publish_public_key(&self, trust: &dyn TrustStore) -> Result<(), IdentityError> {
        let stored = trust
            .put(
                &public_key_key(&self.node_id),
                json!({
                    "nodeId": self.node_id,
                    "publicKey": self.public_key().to_hex(),
                    "timestamp": now_ms(),
                }),
            )
            .await?;
        if !stored {
            warn!(node = %self.node_id.short(), "public key publication found no replicas");
        }
        Ok(())
    }

    /// Look up another node's published verifying key.
    pub async fn get_public_key(
        trust: &dyn TrustStore,
        node_id: &NodeId,
    ) -> Result<Option<PublicKey>, IdentityError> {
        let Some(record) = trust.get(&public_key_key(node_id)).await? else {
            return Ok(None);
        };
        let Some(hex_key) = record.get("publicKey").and_then(Value::as_str) else {
            warn!(node = %node_id.short(), "published key record malformed");
            return Ok(None);
        };
        match PublicKey::from_hex(hex_key) {
            Ok(key) => Ok(Some(key)),
            Err(err) => {
                warn!(node = %node_id.short(), %err, "published key unparsable");
                Ok(None)
            }
        }
    }
}
