//! Trellis Membership Chain
//!
//! Cryptographically gated membership: a peer joins the mesh only by
//! presenting a signed, single-use invitation issued by an existing member.
//! Membership tokens prove admission and authorize issuing further
//! invitations; the genesis peer self-issues under bootstrap designation.
//!
//! Replay protection and public-key publication go through the DHT, reached
//! here via the [`TrustStore`] contract so this crate stays independent of
//! the engine that backs it.

pub mod error;
pub mod service;
pub mod tokens;

pub use error::{IdentityError, TokenError};
pub use service::{consumed_token_key, public_key_key, IdentityService, TrustStore};
pub use tokens::{InvitationToken, MembershipToken, PROTOCOL_VERSION};
