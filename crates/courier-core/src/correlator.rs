//! Outbound message bookkeeping.
//!
//! The correlator owns every in-flight block, the SURB → block mapping used
//! to match acknowledgments, and the per-message reply channel. All of it is
//! guarded by one mutex so that a SURB is consumed at most once and a block
//! can never be acknowledged and retransmitted at the same time. The lock is
//! held only for map updates, never across a transport call.

use crate::config::ArqPolicy;
use crate::error::{Error, Result};
use crate::ids::{BlockKey, MessageId, SurbId};
use courier_crypto::SurbKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Finished outcomes kept for late `wait_for_reply` callers
const FINISHED_CACHE: usize = 1024;

/// One in-flight block of an outbound message
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Owning message
    pub message_id: MessageId,
    /// Index within the message
    pub block_id: u16,
    /// Number of blocks in the message
    pub total_blocks: u16,
    /// Recipient user
    pub recipient: String,
    /// Recipient's provider
    pub provider: String,
    /// Sealed block
    pub payload: Vec<u8>,
    /// Time of the most recent transmission
    pub sent_at: Option<Instant>,
    /// Round-trip estimate for the most recent transmission
    pub reply_eta: Duration,
    /// SURB of the copy currently in flight
    pub surb_id: Option<SurbId>,
    /// Keys for that SURB's reply
    pub surb_keys: Option<SurbKey>,
    /// Retransmit automatically; otherwise expire unacknowledged
    pub reliable: bool,
    /// Attempts so far
    pub transmissions: u32,
    /// A transmission is being handed to the transport right now
    pub in_flight: bool,
}

impl PendingMessage {
    /// A block that has not been transmitted yet
    #[must_use]
    pub fn new(
        key: BlockKey,
        total_blocks: u16,
        recipient: &str,
        provider: &str,
        payload: Vec<u8>,
        reliable: bool,
    ) -> Self {
        Self {
            message_id: key.message_id,
            block_id: key.block_id,
            total_blocks,
            recipient: recipient.to_string(),
            provider: provider.to_string(),
            payload,
            sent_at: None,
            reply_eta: Duration::ZERO,
            surb_id: None,
            surb_keys: None,
            reliable,
            transmissions: 0,
            in_flight: false,
        }
    }

    /// Queue key of this block
    #[must_use]
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.message_id, self.block_id)
    }
}

/// Delivery state of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Blocks still unacknowledged
    Pending,
    /// Every block acknowledged; carries the final ACK plaintext
    Delivered(Vec<u8>),
    /// Retransmission budget exhausted or initial send failed
    Failed,
    /// Session shut down first
    Shutdown,
}

struct OutboundMessage {
    blocks: HashMap<u16, PendingMessage>,
    status: watch::Sender<ReplyStatus>,
}

/// Result of recording a completed transmission
#[derive(Debug, Clone, Copy)]
pub struct Recorded {
    /// Attempts including this one
    pub transmissions: u32,
    /// Whether the block should be scheduled for retransmission
    pub reliable: bool,
    /// SURB this transmission superseded
    pub previous_surb: Option<SurbId>,
}

/// What an incoming SURB id refers to
#[derive(Debug)]
pub enum SurbLookup {
    /// Never issued, already consumed, or superseded
    Unknown,
    /// A loop decoy
    Decoy,
    /// An in-flight block
    Block {
        /// The block
        key: BlockKey,
        /// Keys for opening the reply
        keys: SurbKey,
    },
}

/// Result of acknowledging one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Block already removed
    Gone,
    /// Other blocks of the message are still outstanding
    Partial {
        /// Unacknowledged blocks left
        remaining: usize,
        /// Newer SURB of the block that was still mapped, now unmapped
        stale_surb: Option<SurbId>,
    },
    /// Last block acknowledged. The status stays `Pending` until
    /// [`Correlator::complete`] is called.
    Completed {
        /// Newer SURB of the block that was still mapped, now unmapped
        stale_surb: Option<SurbId>,
    },
}

/// What to do when a block's retransmission deadline fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitDecision {
    /// Block acknowledged or abandoned meanwhile
    Gone,
    /// Send another copy
    Transmit,
    /// Budget exhausted; the message has been abandoned
    Abandon(Retired),
    /// Unreliable block never acknowledged; the message has been dropped
    Expire(Retired),
}

/// Blocks and SURBs released when a message is dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Retired {
    /// Every block of the message
    pub blocks: Vec<BlockKey>,
    /// SURBs that were still mapped to those blocks
    pub surbs: Vec<SurbId>,
}

#[derive(Default)]
struct Inner {
    surbs: HashMap<SurbId, BlockKey>,
    messages: HashMap<MessageId, OutboundMessage>,
    decoys: HashSet<SurbId>,
    finished: HashMap<MessageId, ReplyStatus>,
    finished_order: VecDeque<MessageId>,
    shut_down: bool,
}

impl Inner {
    fn block_mut(&mut self, key: &BlockKey) -> Option<&mut PendingMessage> {
        self.messages
            .get_mut(&key.message_id)?
            .blocks
            .get_mut(&key.block_id)
    }

    fn finish(&mut self, message_id: MessageId, status: ReplyStatus) -> Option<Retired> {
        let message = self.messages.remove(&message_id)?;
        let mut retired = Retired::default();
        for block in message.blocks.values() {
            retired.blocks.push(block.key());
            if let Some(surb) = block.surb_id {
                if self.surbs.remove(&surb).is_some() {
                    retired.surbs.push(surb);
                }
            }
        }
        message.status.send_replace(status.clone());

        if self.finished.insert(message_id, status).is_none() {
            self.finished_order.push_back(message_id);
        }
        while self.finished_order.len() > FINISHED_CACHE {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
        Some(retired)
    }
}

/// Shared store of outbound messages and their SURBs
#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    /// Empty correlator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::poisoned("correlator"))
    }

    /// Start tracking a message made of `blocks`
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` once the correlator has been shut down.
    pub fn register(
        &self,
        message_id: MessageId,
        blocks: Vec<PendingMessage>,
    ) -> Result<watch::Receiver<ReplyStatus>> {
        let mut inner = self.lock()?;
        if inner.shut_down {
            return Err(Error::Shutdown);
        }
        let (status, rx) = watch::channel(ReplyStatus::Pending);
        let blocks = blocks.into_iter().map(|b| (b.block_id, b)).collect();
        inner
            .messages
            .insert(message_id, OutboundMessage { blocks, status });
        Ok(rx)
    }

    /// Subscribe to a message's delivery status.
    ///
    /// Recently finished messages are still answered with their final
    /// status.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMessage` if the message is neither tracked nor
    /// recently finished.
    pub fn subscribe(&self, message_id: &MessageId) -> Result<watch::Receiver<ReplyStatus>> {
        let inner = self.lock()?;
        if let Some(message) = inner.messages.get(message_id) {
            return Ok(message.status.subscribe());
        }
        if let Some(status) = inner.finished.get(message_id) {
            return Ok(watch::channel(status.clone()).1);
        }
        if inner.shut_down {
            return Ok(watch::channel(ReplyStatus::Shutdown).1);
        }
        Err(Error::UnknownMessage(*message_id))
    }

    /// Claim a block for transmission and return a snapshot of it.
    ///
    /// Returns `None` if the block is gone or another transmission of it is
    /// already in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn begin_transmission(&self, key: &BlockKey) -> Result<Option<PendingMessage>> {
        let mut inner = self.lock()?;
        let Some(block) = inner.block_mut(key) else {
            return Ok(None);
        };
        if block.in_flight {
            tracing::debug!("Block {} already in flight", key);
            return Ok(None);
        }
        block.in_flight = true;
        Ok(Some(block.clone()))
    }

    /// Record a transmission the transport accepted.
    ///
    /// Returns `None` if the block was acknowledged or abandoned while the
    /// transport call was running; the new SURB is then never mapped.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn record_transmission(
        &self,
        key: &BlockKey,
        surb_id: SurbId,
        keys: SurbKey,
        eta: Duration,
        sent_at: Instant,
    ) -> Result<Option<Recorded>> {
        let mut inner = self.lock()?;
        let Some(block) = inner.block_mut(key) else {
            return Ok(None);
        };
        block.in_flight = false;
        let previous_surb = block.surb_id.replace(surb_id);
        block.surb_keys = Some(keys);
        block.sent_at = Some(sent_at);
        block.reply_eta = eta;
        block.transmissions += 1;
        let recorded = Recorded {
            transmissions: block.transmissions,
            reliable: block.reliable,
            previous_surb,
        };

        if let Some(previous) = previous_surb {
            inner.surbs.remove(&previous);
        }
        inner.surbs.insert(surb_id, *key);
        Ok(Some(recorded))
    }

    /// Record a transmission the transport rejected.
    ///
    /// The attempt still counts against the budget. Returns the updated
    /// attempt count and the last known ETA, or `None` if the block is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn record_failed_transmission(&self, key: &BlockKey) -> Result<Option<(u32, Duration)>> {
        let mut inner = self.lock()?;
        let Some(block) = inner.block_mut(key) else {
            return Ok(None);
        };
        block.in_flight = false;
        block.transmissions += 1;
        Ok(Some((block.transmissions, block.reply_eta)))
    }

    /// Consume a SURB mapping. Each SURB id resolves to a block at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn take_surb(&self, surb_id: &SurbId) -> Result<SurbLookup> {
        let mut inner = self.lock()?;
        if inner.decoys.remove(surb_id) {
            return Ok(SurbLookup::Decoy);
        }
        let Some(key) = inner.surbs.remove(surb_id) else {
            return Ok(SurbLookup::Unknown);
        };
        let keys = inner
            .block_mut(&key)
            .and_then(|block| block.surb_keys.clone());
        Ok(match keys {
            Some(keys) => SurbLookup::Block { key, keys },
            None => SurbLookup::Unknown,
        })
    }

    /// Remove an acknowledged block together with its SURB mapping.
    ///
    /// A retransmission recorded after the ACK's SURB was taken leaves a newer
    /// SURB mapped; it is unmapped here and returned so its stored keys can
    /// be dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn acknowledge_block(&self, key: &BlockKey) -> Result<AckOutcome> {
        let mut inner = self.lock()?;
        let Some(message) = inner.messages.get_mut(&key.message_id) else {
            return Ok(AckOutcome::Gone);
        };
        let Some(block) = message.blocks.remove(&key.block_id) else {
            return Ok(AckOutcome::Gone);
        };
        let remaining = message.blocks.len();
        let stale_surb = block
            .surb_id
            .filter(|surb| inner.surbs.remove(surb).is_some());

        if remaining > 0 {
            Ok(AckOutcome::Partial {
                remaining,
                stale_surb,
            })
        } else {
            Ok(AckOutcome::Completed { stale_surb })
        }
    }

    /// Publish `Delivered` for a message whose blocks are all acknowledged.
    ///
    /// Returns `false` if the message was already finished or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn complete(&self, message_id: &MessageId, plaintext: Vec<u8>) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner
            .messages
            .get(message_id)
            .is_none_or(|message| !message.blocks.is_empty())
        {
            return Ok(false);
        }
        Ok(inner
            .finish(*message_id, ReplyStatus::Delivered(plaintext))
            .is_some())
    }

    /// Decide what a fired deadline means for `key`.
    ///
    /// When the budget is exhausted, or the block was sent unreliably, the
    /// whole message is dropped here and `Failed` is published.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn begin_retransmit(&self, key: &BlockKey, arq: &ArqPolicy) -> Result<RetransmitDecision> {
        let mut inner = self.lock()?;
        let Some(block) = inner.block_mut(key) else {
            return Ok(RetransmitDecision::Gone);
        };
        let reliable = block.reliable;
        if reliable && arq.can_retransmit(block.transmissions) {
            return Ok(RetransmitDecision::Transmit);
        }
        let retired = inner
            .finish(key.message_id, ReplyStatus::Failed)
            .unwrap_or_default();
        if reliable {
            Ok(RetransmitDecision::Abandon(retired))
        } else {
            Ok(RetransmitDecision::Expire(retired))
        }
    }

    /// Drop a message whose initial send failed; publishes `Failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn retire(&self, message_id: &MessageId) -> Result<Option<Retired>> {
        let mut inner = self.lock()?;
        Ok(inner.finish(*message_id, ReplyStatus::Failed))
    }

    /// Remember a loop decoy's SURB so its reply is recognised
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn add_decoy(&self, surb_id: SurbId) -> Result<()> {
        self.lock()?.decoys.insert(surb_id);
        Ok(())
    }

    /// Forget a decoy SURB that was never sent or has expired.
    ///
    /// Returns `false` if its reply already arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn remove_decoy(&self, surb_id: &SurbId) -> Result<bool> {
        Ok(self.lock()?.decoys.remove(surb_id))
    }

    /// Snapshot of one tracked block
    #[must_use]
    pub fn block(&self, key: &BlockKey) -> Option<PendingMessage> {
        self.inner.lock().ok()?.block_mut(key).cloned()
    }

    /// Ids of all messages with unacknowledged blocks
    #[must_use]
    pub fn pending_messages(&self) -> Vec<MessageId> {
        self.inner
            .lock()
            .map(|inner| inner.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of SURBs that can still be matched to a block or decoy
    #[must_use]
    pub fn outstanding_surbs(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.surbs.len() + inner.decoys.len())
            .unwrap_or(0)
    }

    /// Release every waiter with `Shutdown` and drop all state.
    ///
    /// Later registrations fail with `Error::Shutdown`.
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn shutdown(&self) -> Result<Vec<BlockKey>> {
        let mut inner = self.lock()?;
        inner.shut_down = true;
        let mut blocks = Vec::new();
        for (_, message) in inner.messages.drain() {
            blocks.extend(message.blocks.values().map(PendingMessage::key));
            message.status.send_replace(ReplyStatus::Shutdown);
        }
        inner.surbs.clear();
        inner.decoys.clear();
        Ok(blocks)
    }
}
