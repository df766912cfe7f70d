//! Ed25519 signing identities
//!
//! One compile-time provider (`ed25519-dalek`); no runtime probing. The
//! signing key stays in memory, the verifying half travels as hex on the
//! wire and inside DHT records.

use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// A verifying key, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey(key))
    }

    /// Verify a detached hex-encoded signature over `message`.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<(), CryptoError> {
        let raw = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidSignature)?;
        let bytes: [u8; 64] = raw.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_bytes(&bytes);
        self.0
            .verify(message, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 key pair bound to a device identity.
///
/// Immutable after creation; the secret half never leaves this type except
/// through [`IdentityKeyPair::secret_bytes`] for an application keystore.
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair from the system CSPRNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        IdentityKeyPair { signing }
    }

    /// Restore a key pair from a 32-byte seed previously exported with
    /// [`IdentityKeyPair::secret_bytes`].
    pub fn from_secret_bytes(seed: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = seed.try_into().map_err(|_| CryptoError::InvalidLength {
            expected: 32,
            actual: seed.len(),
        })?;
        Ok(IdentityKeyPair {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Sign `message`, returning the detached signature as hex.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        let signature = self.signing.sign(message);
        hex::encode(signature.to_bytes())
    }

    /// Export the secret seed for persistence. Wrapped so the copy is wiped
    /// when the caller drops it.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeyPair(pub {})", self.public_key())
    }
}
