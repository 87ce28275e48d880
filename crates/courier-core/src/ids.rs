//! Message, SURB and block identifiers.

use crate::{MESSAGE_ID_LENGTH, SURB_ID_LENGTH};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one logical outbound or inbound message.
///
/// Retransmissions reuse the message identifier; only the SURB changes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; MESSAGE_ID_LENGTH]);

/// Identifier of a single-use reply block.
///
/// A fresh one is minted for every transmission attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurbId([u8; SURB_ID_LENGTH]);

macro_rules! impl_id {
    ($name:ident, $len:expr) => {
        impl $name {
            /// Generate a random identifier
            #[must_use]
            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Create from raw bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Create from a slice, `None` if the length is wrong
            #[must_use]
            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                slice.try_into().ok().map(Self)
            }

            /// Raw bytes
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Lowercase hex rendering
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

impl_id!(MessageId, MESSAGE_ID_LENGTH);
impl_id!(SurbId, SURB_ID_LENGTH);

/// Address of one block of an outbound message.
///
/// This is the retransmission unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// Owning message
    pub message_id: MessageId,
    /// Index within the message
    pub block_id: u16,
}

impl BlockKey {
    /// Create a block key
    #[must_use]
    pub const fn new(message_id: MessageId, block_id: u16) -> Self {
        Self {
            message_id,
            block_id,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", hex::encode(&self.message_id.as_bytes()[..8]), self.block_id)
    }
}

/// Entry in the pipeline's delay queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// Retransmission or expiry deadline of an outbound block
    Block(BlockKey),
    /// Expiry of a loop decoy's SURB
    Decoy(SurbId),
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::Block(key) => write!(f, "block {key}"),
            QueueKey::Decoy(surb) => write!(f, "decoy {}", hex::encode(&surb.as_bytes()[..8])),
        }
    }
}
