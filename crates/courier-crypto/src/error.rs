//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Sealed input shorter than its fixed overhead
    #[error("sealed input too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Peer key is a low-order point
    #[error("low-order public key rejected")]
    LowOrderPoint,

    /// Hex decoding failed
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}
