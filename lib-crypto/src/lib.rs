//! Trellis Cryptographic Foundation
//!
//! Shared primitives for the overlay: 160-bit node identifiers with the XOR
//! metric, Ed25519 signing identities, SHA-1 content-key hashing, and the
//! canonical JSON form used as signing input for tokens and topic messages.

pub mod canonical;
pub mod error;
pub mod keys;
pub mod node_id;

pub use canonical::{canonical_json, signing_bytes};
pub use error::CryptoError;
pub use keys::{IdentityKeyPair, PublicKey};
pub use node_id::{Distance, NodeId, NODE_ID_BITS, NODE_ID_BYTES};
