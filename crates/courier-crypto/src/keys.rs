//! X25519 identity keys.
//!
//! Every client holds one long-term identity key. Blocks are sealed from the
//! sender's identity key to the recipient's public key, so the recipient
//! learns (and authenticates) who sent each block.

use crate::{CryptoError, PUBLIC_KEY_SIZE};
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// X25519 private identity key.
#[derive(Clone)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Generate a new random private key from the OS RNG.
    #[must_use]
    pub fn random() -> Self {
        Self::generate(&mut OsRng)
    }

    /// Derive the public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Diffie-Hellman with a peer key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::LowOrderPoint` when the result is all zeros.
    pub fn exchange(&self, peer: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let shared = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(*shared.as_bytes())
    }

    /// Export raw bytes.
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"<redacted>").finish()
    }
}

impl PublicKey {
    /// Import from bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Import from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns an error on bad hex or wrong length.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&raw)
    }

    /// Export as bytes.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_is_symmetric() {
        let alice = PrivateKey::random();
        let bob = PrivateKey::random();

        let ab = alice.exchange(&bob.public_key()).unwrap();
        let ba = bob.exchange(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = PrivateKey::random();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert_eq!(alice.exchange(&zero), Err(CryptoError::LowOrderPoint));
    }

    #[test]
    fn test_private_key_bytes_roundtrip() {
        let key = PrivateKey::random();
        let restored = PrivateKey::from_bytes(key.to_bytes());
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_hex() {
        let key = PrivateKey::random().public_key();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let key = PrivateKey::random();
        assert!(format!("{:?}", key).contains("redacted"));
    }
}
