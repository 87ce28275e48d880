//! Message blocks and fragmentation.
//!
//! A payload larger than one block's capacity is split into sequentially
//! indexed blocks sharing a message identifier. Every block is encoded to a
//! fixed length before sealing so that all blocks on the wire look alike.
//!
//! # Block Layout
//!
//! ```text
//! ┌─────────────────┬──────────────┬──────────────┬──────────────┬─────────┬─────────┐
//! │ message id (16) │ block id (2) │ total (2)    │ length (4)   │ payload │ padding │
//! └─────────────────┴──────────────┴──────────────┴──────────────┴─────────┴─────────┘
//! ```
//!
//! All integers are big-endian.

use crate::ids::MessageId;
use crate::{BLOCK_HEADER_SIZE, MESSAGE_ID_LENGTH};
use courier_crypto::PublicKey;
use thiserror::Error;

/// Current version of the stored [`IngressFragment`] encoding
pub const INGRESS_FRAGMENT_VERSION: u8 = 0;

/// Block-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Encoded block too short to parse
    #[error("block too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared payload length exceeds the encoded block
    #[error("payload length {0} exceeds block")]
    PayloadOverflow(usize),

    /// Block index outside `0..total_blocks`
    #[error("block index {block_id} out of range for {total_blocks} blocks")]
    IndexOutOfRange {
        /// Block index
        block_id: u16,
        /// Declared total
        total_blocks: u16,
    },

    /// Payload needs more blocks than the header can express
    #[error("payload of {0} bytes needs more than 65535 blocks")]
    TooManyBlocks(usize),

    /// Block payload capacity of zero
    #[error("block payload capacity must be non-zero")]
    ZeroCapacity,

    /// Stored fragment has an unknown version byte
    #[error("unsupported fragment version {0}")]
    UnsupportedVersion(u8),
}

/// One block of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Owning message
    pub message_id: MessageId,
    /// Index within the message
    pub block_id: u16,
    /// Number of blocks in the message
    pub total_blocks: u16,
    /// Payload bytes carried by this block
    pub payload: Vec<u8>,
}

impl Block {
    /// Encode with the header and zero padding up to `block_len` bytes
    /// (no padding if the block is already larger).
    #[must_use]
    pub fn to_bytes(&self, block_len: usize) -> Vec<u8> {
        let len = (BLOCK_HEADER_SIZE + self.payload.len()).max(block_len);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(self.message_id.as_bytes());
        out.extend_from_slice(&self.block_id.to_be_bytes());
        out.extend_from_slice(&self.total_blocks.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.resize(len, 0);
        out
    }

    /// Decode a block, ignoring trailing padding
    ///
    /// # Errors
    ///
    /// Returns an error on truncated input, an overlong payload length, or
    /// an index outside the declared total.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, BlockError> {
        if raw.len() < BLOCK_HEADER_SIZE {
            return Err(BlockError::TooShort {
                expected: BLOCK_HEADER_SIZE,
                actual: raw.len(),
            });
        }

        let mut id = [0u8; MESSAGE_ID_LENGTH];
        id.copy_from_slice(&raw[..MESSAGE_ID_LENGTH]);
        let at = MESSAGE_ID_LENGTH;
        let block_id = u16::from_be_bytes([raw[at], raw[at + 1]]);
        let total_blocks = u16::from_be_bytes([raw[at + 2], raw[at + 3]]);
        let len = u32::from_be_bytes([raw[at + 4], raw[at + 5], raw[at + 6], raw[at + 7]]) as usize;

        if block_id >= total_blocks {
            return Err(BlockError::IndexOutOfRange {
                block_id,
                total_blocks,
            });
        }
        let body = &raw[BLOCK_HEADER_SIZE..];
        if len > body.len() {
            return Err(BlockError::PayloadOverflow(len));
        }

        Ok(Self {
            message_id: MessageId::from_bytes(id),
            block_id,
            total_blocks,
            payload: body[..len].to_vec(),
        })
    }
}

/// Split `payload` into blocks of at most `capacity` payload bytes.
///
/// An empty payload still produces one (empty) block.
///
/// # Errors
///
/// Returns an error for a zero capacity or a payload needing more than
/// `u16::MAX` blocks.
pub fn fragment(
    message_id: MessageId,
    payload: &[u8],
    capacity: usize,
) -> Result<Vec<Block>, BlockError> {
    if capacity == 0 {
        return Err(BlockError::ZeroCapacity);
    }
    let count = payload.len().div_ceil(capacity).max(1);
    let total_blocks =
        u16::try_from(count).map_err(|_| BlockError::TooManyBlocks(payload.len()))?;

    if payload.is_empty() {
        return Ok(vec![Block {
            message_id,
            block_id: 0,
            total_blocks,
            payload: Vec::new(),
        }]);
    }

    Ok(payload
        .chunks(capacity)
        .enumerate()
        .map(|(index, chunk)| Block {
            message_id,
            block_id: index as u16,
            total_blocks,
            payload: chunk.to_vec(),
        })
        .collect())
}

/// A received and opened block awaiting reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressFragment {
    /// Authenticated sender identity
    pub sender: PublicKey,
    /// Decoded block
    pub block: Block,
}

impl IngressFragment {
    /// Serialize for storage: `version || sender key || block`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let block = self.block.to_bytes(0);
        let mut out = Vec::with_capacity(1 + courier_crypto::PUBLIC_KEY_SIZE + block.len());
        out.push(INGRESS_FRAGMENT_VERSION);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&block);
        out
    }

    /// Deserialize a stored fragment
    ///
    /// # Errors
    ///
    /// Returns an error on a version mismatch or a malformed block.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, BlockError> {
        let key_end = 1 + courier_crypto::PUBLIC_KEY_SIZE;
        if raw.len() < key_end {
            return Err(BlockError::TooShort {
                expected: key_end,
                actual: raw.len(),
            });
        }
        if raw[0] != INGRESS_FRAGMENT_VERSION {
            return Err(BlockError::UnsupportedVersion(raw[0]));
        }
        let mut key = [0u8; courier_crypto::PUBLIC_KEY_SIZE];
        key.copy_from_slice(&raw[1..key_end]);
        Ok(Self {
            sender: PublicKey::from_bytes(key),
            block: Block::from_bytes(&raw[key_end..])?,
        })
    }
}
