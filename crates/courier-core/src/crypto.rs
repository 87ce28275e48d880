//! Block and acknowledgment cryptography used by the session.

use crate::ACK_PAYLOAD_LENGTH;
use courier_crypto::{CryptoError, PrivateKey, PublicKey, SurbKey, sealed};

/// End-to-end sealing of blocks and opening of SURB replies.
pub trait MessageCrypto: Send + Sync {
    /// Identity key blocks are sealed from
    fn local_key(&self) -> PublicKey;

    /// Seal an encoded block for `recipient`
    ///
    /// # Errors
    ///
    /// Returns an error if key agreement or encryption fails.
    fn seal_block(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Open a block addressed to this client, returning the sender's key
    ///
    /// # Errors
    ///
    /// Returns an error if the block is malformed or fails authentication.
    fn open_block(&self, ciphertext: &[u8]) -> Result<(PublicKey, Vec<u8>), CryptoError>;

    /// Decrypt a reply that arrived on a SURB
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails authentication under `keys`.
    fn open_surb_payload(&self, keys: &SurbKey, payload: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// [`MessageCrypto`] over a long-term X25519 identity key
#[derive(Clone)]
pub struct IdentityCrypto {
    identity: PrivateKey,
}

impl IdentityCrypto {
    /// Wrap an identity key
    #[must_use]
    pub fn new(identity: PrivateKey) -> Self {
        Self { identity }
    }
}

impl MessageCrypto for IdentityCrypto {
    fn local_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    fn seal_block(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        sealed::seal(&self.identity, recipient, plaintext)
    }

    fn open_block(&self, ciphertext: &[u8]) -> Result<(PublicKey, Vec<u8>), CryptoError> {
        sealed::open(&self.identity, ciphertext)
    }

    fn open_surb_payload(&self, keys: &SurbKey, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        keys.open_payload(payload)
    }
}

/// A well-formed acknowledgment decrypts to exactly
/// [`ACK_PAYLOAD_LENGTH`] zero bytes
#[must_use]
pub fn is_valid_ack(plaintext: &[u8]) -> bool {
    plaintext.len() == ACK_PAYLOAD_LENGTH && plaintext.iter().all(|&b| b == 0)
}
