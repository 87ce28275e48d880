//! Sender-authenticated sealed blocks.
//!
//! A sealed block carries the sender's public key in the clear followed by a
//! random nonce and the `XChaCha20-Poly1305` ciphertext:
//!
//! ```text
//! ┌──────────────────┬──────────────┬────────────────────────────┐
//! │ sender key (32)  │ nonce (24)   │ ciphertext + tag (n + 16)  │
//! └──────────────────┴──────────────┴────────────────────────────┘
//! ```
//!
//! The AEAD key is `BLAKE3::derive_key(CONTEXT, dh || sender || recipient)`,
//! where `dh` is the static-static X25519 secret between the two identities.
//! Both public keys are bound as associated data.

use crate::keys::{PrivateKey, PublicKey};
use crate::{CryptoError, NONCE_SIZE, PUBLIC_KEY_SIZE, SEAL_OVERHEAD};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{OsRng, RngCore};
use zeroize::Zeroize;

const CONTEXT: &str = "courier 2024-06 sealed block v0";

fn derive_key(shared: &[u8; 32], sender: &PublicKey, recipient: &PublicKey) -> [u8; 32] {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(sender.as_bytes());
    material[64..].copy_from_slice(recipient.as_bytes());
    let key = blake3::derive_key(CONTEXT, &material);
    material.zeroize();
    key
}

fn associated_data(sender: &PublicKey, recipient: &PublicKey) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(sender.as_bytes());
    aad[32..].copy_from_slice(recipient.as_bytes());
    aad
}

/// Seal `plaintext` from `sender` to `recipient`.
///
/// # Errors
///
/// Returns an error if the recipient key is low-order or encryption fails.
pub fn seal(
    sender: &PrivateKey,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let sender_pub = sender.public_key();
    let mut shared = sender.exchange(recipient)?;
    let mut key = derive_key(&shared, &sender_pub, recipient);
    shared.zeroize();

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &associated_data(&sender_pub, recipient),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(sender_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed block addressed to `recipient`.
///
/// Returns the authenticated sender key together with the plaintext.
///
/// # Errors
///
/// Returns an error on truncated input, a low-order sender key, or
/// authentication failure.
pub fn open(recipient: &PrivateKey, sealed: &[u8]) -> Result<(PublicKey, Vec<u8>), CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::TooShort {
            expected: SEAL_OVERHEAD,
            actual: sealed.len(),
        });
    }

    let sender = PublicKey::from_slice(&sealed[..PUBLIC_KEY_SIZE])?;
    let nonce = &sealed[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE];
    let ciphertext = &sealed[PUBLIC_KEY_SIZE + NONCE_SIZE..];
    let recipient_pub = recipient.public_key();

    let mut shared = recipient.exchange(&sender)?;
    let mut key = derive_key(&shared, &sender, &recipient_pub);
    shared.zeroize();

    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &associated_data(&sender, &recipient_pub),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok((sender, plaintext))
}
