//! # Courier Crypto
//!
//! Cryptographic primitives used by the Courier mix-network client core.
//!
//! This crate provides:
//! - X25519 identity keys for end-to-end block sealing
//! - Sealed blocks (sender-authenticated `XChaCha20-Poly1305` boxes)
//! - SURB payload keys for acknowledgment decryption
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | AEAD | XChaCha20-Poly1305 |
//! | KDF | BLAKE3 `derive_key` |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod keys;
pub mod sealed;
pub mod surb;

pub use error::CryptoError;
pub use keys::{PrivateKey, PublicKey};
pub use surb::SurbKey;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed block adds on top of its plaintext
pub const SEAL_OVERHEAD: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE;

/// Bytes a sealed SURB payload adds on top of its plaintext
pub const SURB_PAYLOAD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
