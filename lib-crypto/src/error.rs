//! Crypto error taxonomy

use thiserror::Error;

/// Failures surfaced by identifier parsing and signature handling.
///
/// Crypto failures are terminal for the operation that hit them; callers log
/// and drop rather than retry.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),

    #[error("invalid identifier length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("malformed public key")]
    InvalidPublicKey,

    #[error("malformed signature")]
    InvalidSignature,

    #[error("signature verification failed")]
    VerificationFailed,
}
