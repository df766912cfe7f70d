//! Identity error taxonomy

use thiserror::Error;

/// Token validation failures. Each is terminal for the token in question:
/// invalid tokens are rejected once, logged, and never retried.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("structurally invalid token: {0}")]
    Structural(&'static str),

    #[error("token expired at {expires}, now {now}")]
    Expired { expires: u64, now: u64 },

    #[error("token signature did not verify")]
    BadSignature,

    #[error("invitation addressed to {addressed}, local node is {local}")]
    WrongInvitee { addressed: String, local: String },

    #[error("invitation nonce already consumed")]
    Replayed,

    #[error("no membership token held; cannot issue invitations")]
    MembershipRequired,

    #[error("genesis membership claimed without bootstrap designation")]
    IllegalGenesis,
}

/// Failures surfaced by the identity service.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("trust store operation failed: {0}")]
    Store(#[from] anyhow::Error),
}
