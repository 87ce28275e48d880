//! SURB payload keys.
//!
//! Each transmission hands the transport a fresh SURB; the transport returns
//! the key material needed to decrypt whatever comes back over it. A reply
//! payload is `nonce (24) || XChaCha20-Poly1305(key, plaintext)`.

use crate::{AEAD_KEY_SIZE, CryptoError, NONCE_SIZE, SURB_PAYLOAD_OVERHEAD};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand_core::{OsRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Decryption key for one SURB reply.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SurbKey([u8; AEAD_KEY_SIZE]);

impl SurbKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; AEAD_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Import key material as handed out by a transport.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; AEAD_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: AEAD_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.0
    }

    /// Encrypt a reply payload (done by whoever answers over the SURB).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal_payload(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(SURB_PAYLOAD_OVERHEAD + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a reply payload.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated input or authentication failure.
    pub fn open_payload(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < SURB_PAYLOAD_OVERHEAD {
            return Err(CryptoError::TooShort {
                expected: SURB_PAYLOAD_OVERHEAD,
                actual: payload.len(),
            });
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SurbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SurbKey(<redacted>)")
    }
}
