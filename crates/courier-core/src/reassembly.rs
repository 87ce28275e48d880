//! Inbound block reassembly.
//!
//! Fragments of a multi-block message are accumulated through the storage
//! collaborator, so partial progress survives a restart. After every new
//! fragment an attempt is made to reassemble; a message is produced only once
//! every index `0..total_blocks` is present, at which point the stored
//! fragments are discarded.

use crate::block::{BlockError, IngressFragment};
use crate::ids::MessageId;
use crate::storage::{Storage, StorageError};
use courier_crypto::PublicKey;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Reassembly errors
#[derive(Debug, Error, Clone)]
pub enum ReassemblyError {
    /// Fragment disagrees with fragments already stored for the message
    #[error("inconsistent fragment for message {}: {reason}", hex::encode(&message_id.as_bytes()[..8]))]
    Inconsistent {
        /// Message identifier
        message_id: MessageId,
        /// What did not match
        reason: &'static str,
    },

    /// A stored fragment could not be decoded
    #[error("corrupt stored fragment: {0}")]
    Corrupt(#[from] BlockError),

    /// Storage failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// A fully reassembled inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Message identifier chosen by the sender
    pub message_id: MessageId,
    /// Authenticated sender identity
    pub sender: PublicKey,
    /// Reassembled plaintext
    pub payload: Vec<u8>,
}

/// Accumulates fragments and produces complete messages
pub struct Reassembler {
    storage: Arc<dyn Storage>,
    completed: HashSet<MessageId>,
    completed_order: VecDeque<MessageId>,
    completed_cache: usize,
}

impl Reassembler {
    /// Create a reassembler remembering up to `completed_cache` finished
    /// message ids (late duplicates of those are dropped).
    pub fn new(storage: Arc<dyn Storage>, completed_cache: usize) -> Self {
        Self {
            storage,
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            completed_cache,
        }
    }

    fn mark_completed(&mut self, message_id: MessageId) {
        if self.completed_cache == 0 || !self.completed.insert(message_id) {
            return;
        }
        self.completed_order.push_back(message_id);
        while self.completed_order.len() > self.completed_cache {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }

    /// Feed one fragment.
    ///
    /// Returns the complete message once its last missing fragment arrives,
    /// `None` while fragments are still outstanding or when the fragment is
    /// a duplicate.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment contradicts stored fragments for
    /// the same message, or when storage fails.
    pub async fn ingest(
        &mut self,
        fragment: IngressFragment,
    ) -> Result<Option<ReceivedMessage>, ReassemblyError> {
        let message_id = fragment.block.message_id;

        if self.completed.contains(&message_id) {
            tracing::debug!(
                "Dropping fragment {} of already delivered message {}",
                fragment.block.block_id,
                message_id
            );
            return Ok(None);
        }

        if fragment.block.total_blocks == 1 {
            self.mark_completed(message_id);
            return Ok(Some(ReceivedMessage {
                message_id,
                sender: fragment.sender,
                payload: fragment.block.payload,
            }));
        }

        let mut stored = self
            .storage
            .get_fragments(&message_id)
            .await?
            .iter()
            .map(|raw| IngressFragment::from_bytes(raw))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(first) = stored.first() {
            if first.sender != fragment.sender {
                return Err(ReassemblyError::Inconsistent {
                    message_id,
                    reason: "sender key mismatch",
                });
            }
            if first.block.total_blocks != fragment.block.total_blocks {
                return Err(ReassemblyError::Inconsistent {
                    message_id,
                    reason: "total block count mismatch",
                });
            }
        }

        if stored
            .iter()
            .any(|f| f.block.block_id == fragment.block.block_id)
        {
            tracing::debug!(
                "Duplicate fragment {} for message {}",
                fragment.block.block_id,
                message_id
            );
            return Ok(None);
        }

        self.storage
            .put_fragment(&message_id, fragment.to_bytes())
            .await?;
        let sender = fragment.sender;
        let total = fragment.block.total_blocks;
        stored.push(fragment);

        match reassemble(&mut stored, total) {
            Some(payload) => {
                self.storage.remove_fragments(&message_id).await?;
                self.mark_completed(message_id);
                Ok(Some(ReceivedMessage {
                    message_id,
                    sender,
                    payload,
                }))
            }
            None => {
                tracing::trace!(
                    "Message {}: {}/{} fragments present",
                    message_id,
                    stored.len(),
                    total
                );
                Ok(None)
            }
        }
    }
}

/// Concatenate fragments in index order if all `total` indices are present.
fn reassemble(fragments: &mut [IngressFragment], total: u16) -> Option<Vec<u8>> {
    fragments.sort_by_key(|f| f.block.block_id);
    let complete = fragments.len() == usize::from(total)
        && fragments
            .iter()
            .enumerate()
            .all(|(i, f)| usize::from(f.block.block_id) == i);
    if !complete {
        return None;
    }
    Some(
        fragments
            .iter()
            .flat_map(|f| f.block.payload.iter().copied())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::fragment;
    use crate::storage::MemoryStorage;

    fn fragments_for(payload: &[u8], capacity: usize, sender: PublicKey) -> Vec<IngressFragment> {
        fragment(MessageId::random(), payload, capacity)
            .unwrap()
            .into_iter()
            .map(|block| IngressFragment { sender, block })
            .collect()
    }

    #[tokio::test]
    async fn test_single_block_delivered_immediately() {
        let storage = MemoryStorage::new();
        let mut reassembler = Reassembler::new(Arc::new(storage.clone()), 16);
        let sender = PublicKey::from_bytes([1u8; 32]);

        let mut frags = fragments_for(b"short", 100, sender);
        let msg = reassembler.ingest(frags.remove(0)).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"short");
        assert_eq!(msg.sender, sender);
        assert_eq!(storage.partial_messages().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_blocks() {
        let storage = MemoryStorage::new();
        let mut reassembler = Reassembler::new(Arc::new(storage.clone()), 16);
        let sender = PublicKey::from_bytes([2u8; 32]);
        let payload: Vec<u8> = (0..25u8).collect();
        let frags = fragments_for(&payload, 10, sender);
        assert_eq!(frags.len(), 3);

        assert!(reassembler.ingest(frags[0].clone()).await.unwrap().is_none());
        assert!(reassembler.ingest(frags[2].clone()).await.unwrap().is_none());
        assert_eq!(storage.partial_messages().await, 1);

        let msg = reassembler.ingest(frags[1].clone()).await.unwrap().unwrap();
        assert_eq!(msg.payload, payload);
        assert_eq!(storage.partial_messages().await, 0);
    }

    #[tokio::test]
    async fn test_duplicates_do_not_notify_twice() {
        let storage = Arc::new(MemoryStorage::new());
        let mut reassembler = Reassembler::new(storage, 16);
        let sender = PublicKey::from_bytes([3u8; 32]);
        let frags = fragments_for(&[7u8; 30], 10, sender);

        assert!(reassembler.ingest(frags[0].clone()).await.unwrap().is_none());
        assert!(reassembler.ingest(frags[0].clone()).await.unwrap().is_none());
        assert!(reassembler.ingest(frags[1].clone()).await.unwrap().is_none());
        assert!(reassembler.ingest(frags[2].clone()).await.unwrap().is_some());

        // Late duplicate of a finished message
        assert!(reassembler.ingest(frags[1].clone()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sender_mismatch_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut reassembler = Reassembler::new(storage, 16);
        let mut frags = fragments_for(&[1u8; 20], 10, PublicKey::from_bytes([4u8; 32]));

        reassembler.ingest(frags[0].clone()).await.unwrap();
        frags[1].sender = PublicKey::from_bytes([5u8; 32]);
        assert!(matches!(
            reassembler.ingest(frags[1].clone()).await,
            Err(ReassemblyError::Inconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn test_total_mismatch_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut reassembler = Reassembler::new(storage, 16);
        let mut frags = fragments_for(&[1u8; 30], 10, PublicKey::from_bytes([6u8; 32]));

        reassembler.ingest(frags[0].clone()).await.unwrap();
        frags[1].block.total_blocks = 4;
        assert!(matches!(
            reassembler.ingest(frags[1].clone()).await,
            Err(ReassemblyError::Inconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_state_survives_new_reassembler() {
        let storage = Arc::new(MemoryStorage::new());
        let sender = PublicKey::from_bytes([8u8; 32]);
        let frags = fragments_for(&[9u8; 20], 10, sender);

        let mut first = Reassembler::new(storage.clone(), 16);
        assert!(first.ingest(frags[0].clone()).await.unwrap().is_none());
        drop(first);

        let mut second = Reassembler::new(storage, 16);
        let msg = second.ingest(frags[1].clone()).await.unwrap().unwrap();
        assert_eq!(msg.payload, vec![9u8; 20]);
    }

    #[test]
    fn test_completed_cache_bounded() {
        let mut reassembler = Reassembler::new(Arc::new(MemoryStorage::new()), 2);
        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::random()).collect();
        for id in &ids {
            reassembler.mark_completed(*id);
        }
        assert!(!reassembler.completed.contains(&ids[0]));
        assert!(reassembler.completed.contains(&ids[2]));
        assert_eq!(reassembler.completed_order.len(), 2);
    }
}
