//! 160-bit node identifiers and the XOR distance metric
//!
//! A `NodeId` is the only value routing decisions are made on; endpoints are
//! metadata attached elsewhere. Identifiers come from two sources: fresh
//! random bits for a device identity, or SHA-1 of a UTF-8 key string for
//! content keys. Both live in the same 160-bit space.

use crate::error::CryptoError;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// Identifier width in bytes.
pub const NODE_ID_BYTES: usize = 20;

/// Identifier width in bits.
pub const NODE_ID_BITS: u32 = 160;

/// A 160-bit overlay identifier.
///
/// Total ordering is plain byte comparison, which doubles as the tie-break
/// rule everywhere the protocol needs one (lookup result ordering, dial
/// initiator selection, negotiation politeness).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    /// Generate a random identifier from the system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Hash a UTF-8 key string into the identifier space.
    ///
    /// Used for content keys, never for node identity.
    pub fn from_key(key: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&digest);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s).map_err(|_| CryptoError::InvalidHex(s.to_string()))?;
        if raw.len() != NODE_ID_BYTES {
            return Err(CryptoError::InvalidLength {
                expected: NODE_ID_BYTES,
                actual: raw.len(),
            });
        }
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(NodeId(bytes))
    }

    /// First eight hex characters, used for request-id prefixes and logs.
    pub fn short(&self) -> String {
        let full = self.to_hex();
        full[..8].to_string()
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Bit accessor, MSB-first: bit 0 is the most significant bit.
    pub fn bit(&self, index: u32) -> bool {
        debug_assert!(index < NODE_ID_BITS);
        let byte = self.0[(index / 8) as usize];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// Flip the bit at `index`, producing an identifier at a chosen distance
    /// range from this one. Used to synthesize bucket-refresh targets.
    pub fn with_flipped_bit(&self, index: u32) -> NodeId {
        debug_assert!(index < NODE_ID_BITS);
        let mut bytes = self.0;
        bytes[(index / 8) as usize] ^= 1 << (7 - (index % 8));
        NodeId(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two identifiers, ordered as a 160-bit unsigned value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; NODE_ID_BYTES]);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, in `[0, 160]`.
    ///
    /// 160 means the distance is zero (identical identifiers).
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_is_symmetric_and_zero_to_self() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&a).leading_zero_bits(), NODE_ID_BITS);
    }

    #[test]
    fn hex_round_trip() {
        let a = NodeId::random();
        let parsed = NodeId::from_hex(&a.to_hex()).unwrap();
        assert_eq!(a, parsed);

        let d = a.distance(&NodeId::random());
        assert_eq!(d.to_hex(), d.to_hex());
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            NodeId::from_hex("zz"),
            Err(CryptoError::InvalidHex(_))
        ));
        assert!(matches!(
            NodeId::from_hex("aabb"),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn leading_zeros_match_first_set_bit() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_BYTES]);

        // 0x80 in the first byte: no leading zeros.
        assert_eq!(zero.distance(&id_with_first_byte(0x80)).leading_zero_bits(), 0);
        // 0x01 in the first byte: seven leading zeros.
        assert_eq!(zero.distance(&id_with_first_byte(0x01)).leading_zero_bits(), 7);

        // Set only the last bit of the last byte: 159 leading zeros.
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[NODE_ID_BYTES - 1] = 0x01;
        let lowest = NodeId::from_bytes(bytes);
        assert_eq!(zero.distance(&lowest).leading_zero_bits(), 159);
    }

    #[test]
    fn bit_accessor_is_msb_first() {
        let id = id_with_first_byte(0x80);
        assert!(id.bit(0));
        assert!(!id.bit(1));

        let flipped = id.with_flipped_bit(0);
        assert!(!flipped.bit(0));
        assert_eq!(flipped, NodeId::from_bytes([0u8; NODE_ID_BYTES]));
    }

    #[test]
    fn content_keys_are_deterministic() {
        let a = NodeId::from_key("hello");
        let b = NodeId::from_key("hello");
        let c = NodeId::from_key("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_byte_order() {
        let lo = id_with_first_byte(0x01);
        let hi = id_with_first_byte(0x02);
        assert!(lo < hi);
    }

    #[test]
    fn serde_uses_hex_strings() {
        let a = NodeId::from_key("serde");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a.to_hex()));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
