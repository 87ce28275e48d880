//! Send pipeline: composition, transmission, retransmission and ACK matching.
//!
//! [`SendPipeline::transmit`] is the only place a block is handed to the
//! transport. It is used for the first attempt and for every retry, so the
//! SURB bookkeeping and the retry budget are applied the same way each time.
//!
//! Every accepted transmission leaves one entry in the delay queue: the
//! retransmission deadline of a reliable block, or the expiry of an
//! unreliable block or loop decoy. Nothing outlives its entry unacknowledged.

use crate::block::fragment;
use crate::config::{ArqPolicy, ServiceAddress};
use crate::correlator::{
    AckOutcome, Correlator, PendingMessage, ReplyStatus, Retired, RetransmitDecision, SurbLookup,
};
use crate::crypto::{MessageCrypto, is_valid_ack};
use crate::delay_queue::DelayQueue;
use crate::error::Result;
use crate::ids::{BlockKey, MessageId, QueueKey, SurbId};
use crate::storage::{EgressRecord, Storage, SurbKeyRecord};
use crate::transport::Transport;
use crate::BLOCK_HEADER_SIZE;
use courier_crypto::PublicKey;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;

/// Result of one transmission attempt that reached the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmitted {
    /// Sent; retransmission (reliable) or expiry (unreliable) due at the
    /// deadline
    Scheduled(Instant),
    /// Block acknowledged or abandoned before or during the attempt
    Gone,
}

/// What an incoming ACK turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// Stale, duplicate or never issued
    Unknown,
    /// Reply to a loop decoy
    Decoy,
    /// Failed to decrypt or not a valid acknowledgment
    Invalid,
    /// Block acknowledged; more remain
    Pending,
    /// Last block acknowledged
    Completed(MessageId),
}

/// Composes, transmits and retransmits outbound blocks
pub struct SendPipeline {
    correlator: Arc<Correlator>,
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn MessageCrypto>,
    storage: Arc<dyn Storage>,
    queue: DelayQueue<QueueKey>,
    arq: ArqPolicy,
    block_payload_len: usize,
}

impl SendPipeline {
    /// Build a pipeline around an existing correlator and delay queue
    #[must_use]
    pub fn new(
        correlator: Arc<Correlator>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn MessageCrypto>,
        storage: Arc<dyn Storage>,
        queue: DelayQueue<QueueKey>,
        arq: ArqPolicy,
        block_payload_len: usize,
    ) -> Self {
        Self {
            correlator,
            transport,
            crypto,
            storage,
            queue,
            arq,
            block_payload_len,
        }
    }

    /// Correlator backing this pipeline
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Retransmission and expiry queue
    #[must_use]
    pub fn queue(&self) -> &DelayQueue<QueueKey> {
        &self.queue
    }

    /// Encoded length of every block before sealing
    #[must_use]
    pub fn block_length(&self) -> usize {
        BLOCK_HEADER_SIZE + self.block_payload_len
    }

    /// Fragment and seal `payload` for `recipient_key`
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be fragmented or sealing fails.
    pub fn compose(
        &self,
        message_id: MessageId,
        recipient: &str,
        provider: &str,
        recipient_key: &PublicKey,
        payload: &[u8],
        reliable: bool,
    ) -> Result<Vec<PendingMessage>> {
        let block_len = self.block_length();
        fragment(message_id, payload, self.block_payload_len)?
            .into_iter()
            .map(|block| -> Result<PendingMessage> {
                let sealed = self
                    .crypto
                    .seal_block(recipient_key, &block.to_bytes(block_len))?;
                Ok(PendingMessage::new(
                    BlockKey::new(message_id, block.block_id),
                    block.total_blocks,
                    recipient,
                    provider,
                    sealed,
                    reliable,
                ))
            })
            .collect()
    }

    /// Register and transmit a new message.
    ///
    /// # Errors
    ///
    /// Any transport error on a first attempt retires the whole message and
    /// is returned.
    pub async fn submit(
        &self,
        recipient: &str,
        provider: &str,
        recipient_key: &PublicKey,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(MessageId, watch::Receiver<ReplyStatus>)> {
        let message_id = MessageId::random();
        let blocks = self.compose(message_id, recipient, provider, recipient_key, payload, reliable)?;
        let keys: Vec<BlockKey> = blocks.iter().map(PendingMessage::key).collect();

        for block in &blocks {
            self.persist_egress(block).await;
        }
        let status = self.correlator.register(message_id, blocks)?;

        tracing::debug!(
            "Sending message {} to {}@{} in {} block(s), reliable={}",
            message_id,
            recipient,
            provider,
            keys.len(),
            reliable
        );

        for key in &keys {
            let outcome = match self.transmit(key).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!("Initial send of block {} failed: {}", key, e);
                    self.retire(&message_id).await?;
                    return Err(e);
                }
            };
            if let Transmitted::Scheduled(deadline) = outcome {
                self.queue.push(QueueKey::Block(*key), deadline)?;
            }
        }

        Ok((message_id, status))
    }

    /// Hand one block to the transport under a fresh SURB.
    ///
    /// The block's egress record is rewritten with the new SURB before the
    /// send, so no ACK can complete the message ahead of that write.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the send failed; the attempt is then
    /// counted but nothing is scheduled.
    pub async fn transmit(&self, key: &BlockKey) -> Result<Transmitted> {
        let Some(mut block) = self.correlator.begin_transmission(key)? else {
            return Ok(Transmitted::Gone);
        };
        let surb_id = SurbId::random();
        block.surb_id = Some(surb_id);
        self.persist_egress(&block).await;

        let receipt = match self
            .transport
            .send_ciphertext(&block.recipient, &block.provider, &surb_id, &block.payload)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.correlator.record_failed_transmission(key)?;
                return Err(e.into());
            }
        };

        let sent_at = Instant::now();
        let surb_record = SurbKeyRecord {
            surb_id,
            message_id: key.message_id,
            block_id: key.block_id,
            keys: receipt.keys.as_bytes().to_vec(),
        };
        let Some(recorded) = self.correlator.record_transmission(
            key,
            surb_id,
            receipt.keys,
            receipt.eta,
            sent_at,
        )?
        else {
            tracing::debug!("Block {} finished during transmission; dropping SURB", key);
            return Ok(Transmitted::Gone);
        };

        if let Err(e) = self.storage.add_surb_keys(&surb_record).await {
            tracing::warn!("Failed to persist SURB keys for {}: {}", key, e);
        }
        if let Some(previous) = recorded.previous_surb {
            if let Err(e) = self.storage.remove_surb_keys(&previous).await {
                tracing::warn!("Failed to remove superseded SURB keys: {}", e);
            }
        }

        tracing::debug!(
            "Transmitted block {} (attempt {}, eta {:?})",
            key,
            recorded.transmissions,
            receipt.eta
        );

        let deadline = if recorded.reliable {
            self.arq
                .deadline(sent_at, receipt.eta, recorded.transmissions)
        } else {
            self.arq.expiry(sent_at, receipt.eta)
        };
        Ok(Transmitted::Scheduled(deadline))
    }

    /// Handle a fired delay queue entry.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal state failures.
    pub async fn on_deadline(&self, key: &QueueKey) -> Result<()> {
        match key {
            QueueKey::Block(block) => self.retransmit(block).await,
            QueueKey::Decoy(surb_id) => {
                if self.correlator.remove_decoy(surb_id)? {
                    tracing::debug!("Loop decoy {} expired without a reply", surb_id);
                }
                Ok(())
            }
        }
    }

    /// Handle a fired deadline for block `key`.
    ///
    /// Retransmits within budget, otherwise abandons the message. An
    /// unreliable message is dropped with `Failed` instead.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal state failures; transport errors
    /// are logged and the block is rescheduled.
    pub async fn retransmit(&self, key: &BlockKey) -> Result<()> {
        match self.correlator.begin_retransmit(key, &self.arq)? {
            RetransmitDecision::Gone => Ok(()),
            RetransmitDecision::Expire(retired) => {
                tracing::debug!(
                    "Unreliable message {} expired unacknowledged",
                    key.message_id
                );
                self.release(&key.message_id, &retired).await
            }
            RetransmitDecision::Abandon(retired) => {
                tracing::warn!(
                    "Abandoning message {} after {} transmissions of block {}",
                    key.message_id,
                    self.arq.max_transmissions,
                    key.block_id
                );
                self.release(&key.message_id, &retired).await
            }
            RetransmitDecision::Transmit => match self.transmit(key).await {
                Ok(Transmitted::Scheduled(deadline)) => {
                    tracing::debug!("Retransmitted block {}", key);
                    Ok(self.queue.push(QueueKey::Block(*key), deadline)?)
                }
                Ok(Transmitted::Gone) => Ok(()),
                Err(e) => {
                    tracing::warn!("Retransmission of block {} failed: {}", key, e);
                    if let Some(block) = self.correlator.block(key) {
                        let deadline = self.arq.deadline(
                            Instant::now(),
                            block.reply_eta,
                            block.transmissions,
                        );
                        self.queue.push(QueueKey::Block(*key), deadline)?;
                    }
                    Ok(())
                }
            },
        }
    }

    /// Match an ACK against in-flight blocks.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal state failures.
    pub async fn acknowledge(&self, surb_id: &SurbId, payload: &[u8]) -> Result<AckResult> {
        let (key, keys) = match self.correlator.take_surb(surb_id)? {
            SurbLookup::Unknown => {
                tracing::warn!("Dropping ACK for unknown or superseded SURB {}", surb_id);
                return Ok(AckResult::Unknown);
            }
            SurbLookup::Decoy => {
                tracing::debug!("Loop decoy {} returned", surb_id);
                self.queue.remove(&QueueKey::Decoy(*surb_id))?;
                return Ok(AckResult::Decoy);
            }
            SurbLookup::Block { key, keys } => (key, keys),
        };

        if let Err(e) = self.storage.remove_surb_keys(surb_id).await {
            tracing::warn!("Failed to remove SURB keys: {}", e);
        }

        let plaintext = match self.crypto.open_surb_payload(&keys, payload) {
            Ok(plaintext) if is_valid_ack(&plaintext) => plaintext,
            Ok(_) => {
                tracing::error!("ACK for block {} is not all zeros; ignoring", key);
                return Ok(AckResult::Invalid);
            }
            Err(e) => {
                tracing::error!("ACK for block {} failed to decrypt: {}", key, e);
                return Ok(AckResult::Invalid);
            }
        };

        let outcome = self.correlator.acknowledge_block(&key)?;
        self.queue.remove(&QueueKey::Block(key))?;

        match outcome {
            AckOutcome::Gone => Ok(AckResult::Unknown),
            AckOutcome::Partial {
                remaining,
                stale_surb,
            } => {
                self.forget_surb(stale_surb).await;
                tracing::debug!("Block {} acknowledged, {} remaining", key, remaining);
                Ok(AckResult::Pending)
            }
            AckOutcome::Completed { stale_surb } => {
                self.forget_surb(stale_surb).await;
                // Storage is clean before any waiter observes `Delivered`
                if let Err(e) = self.storage.remove_egress(&key.message_id).await {
                    tracing::warn!("Failed to remove egress records: {}", e);
                }
                if !self.correlator.complete(&key.message_id, plaintext)? {
                    return Ok(AckResult::Unknown);
                }
                tracing::info!("Message {} delivered", key.message_id);
                Ok(AckResult::Completed(key.message_id))
            }
        }
    }

    /// Send a zero-filled decoy block to `target`, sealed for ourselves.
    ///
    /// Decoys are not registered as outbound messages, so they are never
    /// retransmitted and never reported to the consumer. Their SURB is
    /// recognised until it expires like an unreliable block's.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the transport fails.
    pub async fn send_decoy(&self, target: &ServiceAddress) -> Result<SurbId> {
        let block = vec![0u8; self.block_length()];
        let sealed = self.crypto.seal_block(&self.crypto.local_key(), &block)?;
        let surb_id = SurbId::random();

        self.correlator.add_decoy(surb_id)?;
        let receipt = match self
            .transport
            .send_ciphertext(&target.recipient, &target.provider, &surb_id, &sealed)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.correlator.remove_decoy(&surb_id)?;
                return Err(e.into());
            }
        };
        let expiry = self.arq.expiry(Instant::now(), receipt.eta);
        self.queue.push(QueueKey::Decoy(surb_id), expiry)?;
        tracing::trace!("Loop decoy sent to {}", target);
        Ok(surb_id)
    }

    async fn retire(&self, message_id: &MessageId) -> Result<()> {
        match self.correlator.retire(message_id)? {
            Some(retired) => self.release(message_id, &retired).await,
            None => Ok(()),
        }
    }

    async fn forget_surb(&self, surb_id: Option<SurbId>) {
        if let Some(surb_id) = surb_id {
            if let Err(e) = self.storage.remove_surb_keys(&surb_id).await {
                tracing::warn!("Failed to remove SURB keys: {}", e);
            }
        }
    }

    async fn release(&self, message_id: &MessageId, retired: &Retired) -> Result<()> {
        for key in &retired.blocks {
            self.queue.remove(&QueueKey::Block(*key))?;
        }
        for surb in &retired.surbs {
            if let Err(e) = self.storage.remove_surb_keys(surb).await {
                tracing::warn!("Failed to remove SURB keys: {}", e);
            }
        }
        if let Err(e) = self.storage.remove_egress(message_id).await {
            tracing::warn!("Failed to remove egress records: {}", e);
        }
        Ok(())
    }

    async fn persist_egress(&self, block: &PendingMessage) {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|now| now.as_secs() + EGRESS_LIFETIME_SECS);
        let record = EgressRecord {
            message_id: block.message_id,
            block_id: block.block_id,
            total_blocks: block.total_blocks,
            recipient: block.recipient.clone(),
            provider: block.provider.clone(),
            reliable: block.reliable,
            payload: block.payload.clone(),
            surb_id: block.surb_id,
            expiration,
        };
        if let Err(e) = self.storage.put_egress(&record).await {
            tracing::warn!("Failed to persist egress block {}: {}", block.key(), e);
        }
    }

    /// Stop the retransmission queue and release every waiter
    ///
    /// # Errors
    ///
    /// Returns an error if the correlator lock is poisoned.
    pub fn shutdown(&self) -> Result<()> {
        self.queue.shutdown();
        self.correlator.shutdown()?;
        Ok(())
    }
}

/// Egress records older than this are considered expired
const EGRESS_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityCrypto;
    use crate::storage::{MemoryStorage, StorageError};
    use crate::transport::{SurbReceipt, TransportError, TransportResult};
    use async_trait::async_trait;
    use courier_crypto::{PrivateKey, SurbKey};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records every send and returns a fixed ETA
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(SurbId, SurbKey, Instant)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_ciphertext(
            &self,
            _recipient: &str,
            _provider: &str,
            surb_id: &SurbId,
            _payload: &[u8],
        ) -> TransportResult<SurbReceipt> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("down".into()));
            }
            let keys = SurbKey::generate();
            self.sent
                .lock()
                .unwrap()
                .push((*surb_id, keys.clone(), Instant::now()));
            Ok(SurbReceipt {
                keys,
                eta: Duration::from_secs(2),
            })
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: SendPipeline,
        transport: Arc<RecordingTransport>,
        storage: MemoryStorage,
        fired: mpsc::Receiver<QueueKey>,
        recipient: PublicKey,
    }

    fn harness(block_payload_len: usize) -> Harness {
        let storage = MemoryStorage::new();
        harness_with_storage(block_payload_len, storage.clone(), Arc::new(storage))
    }

    fn harness_with_storage(
        block_payload_len: usize,
        storage: MemoryStorage,
        backing: Arc<dyn Storage>,
    ) -> Harness {
        let (tx, fired) = mpsc::channel(1024);
        let transport = Arc::new(RecordingTransport::default());
        let pipeline = SendPipeline::new(
            Arc::new(Correlator::new()),
            transport.clone(),
            Arc::new(IdentityCrypto::new(PrivateKey::random())),
            backing,
            DelayQueue::new(tx),
            ArqPolicy::default(),
            block_payload_len,
        );
        Harness {
            pipeline,
            transport,
            storage,
            fired,
            recipient: PrivateKey::random().public_key(),
        }
    }

    fn ack_for(transport: &RecordingTransport, index: usize) -> (SurbId, Vec<u8>) {
        let sent = transport.sent.lock().unwrap();
        let (surb, keys, _) = &sent[index];
        (*surb, keys.seal_payload(&[0u8; crate::ACK_PAYLOAD_LENGTH]).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_compose_pads_every_block() {
        let h = harness(100);
        let blocks = h
            .pipeline
            .compose(MessageId::random(), "bob", "acme.net", &h.recipient, &[1u8; 250], true)
            .unwrap();
        assert_eq!(blocks.len(), 3);
        let expected = h.pipeline.block_length() + courier_crypto::SEAL_OVERHEAD;
        assert!(blocks.iter().all(|b| b.payload.len() == expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_schedules_reliable_blocks() {
        let h = harness(100);
        let (id, _status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, &[1u8; 150], true)
            .await
            .unwrap();

        assert_eq!(h.transport.sent.lock().unwrap().len(), 2);
        assert_eq!(h.pipeline.queue().len(), 2);
        assert_eq!(h.storage.surb_count().await, 2);
        assert_eq!(h.pipeline.correlator().pending_messages(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_expires_without_retransmission() {
        let mut h = harness(100);
        let start = Instant::now();
        let (_, status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", false)
            .await
            .unwrap();
        assert_eq!(h.pipeline.queue().len(), 1);
        assert_eq!(h.pipeline.correlator().outstanding_surbs(), 1);

        let key = h.fired.recv().await.unwrap();
        assert_eq!((Instant::now() - start).as_secs(), 7);
        h.pipeline.on_deadline(&key).await.unwrap();

        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
        assert_eq!(*status.borrow(), ReplyStatus::Failed);
        assert!(h.pipeline.queue().is_empty());
        assert_eq!(h.pipeline.correlator().outstanding_surbs(), 0);
        assert_eq!(h.storage.surb_count().await, 0);
        assert!(h.storage.egress_records().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_unreliable_and_decoy_traffic_is_reclaimed() {
        let mut h = harness(100);
        let target = ServiceAddress::new("loop", "acme.net");
        let mut waiters = Vec::new();
        for _ in 0..200 {
            let (_, status) = h
                .pipeline
                .submit("bob", "acme.net", &h.recipient, b"hi", false)
                .await
                .unwrap();
            waiters.push(status);
            h.pipeline.send_decoy(&target).await.unwrap();
        }
        assert_eq!(h.pipeline.correlator().outstanding_surbs(), 400);

        for _ in 0..400 {
            let key = h.fired.recv().await.unwrap();
            h.pipeline.on_deadline(&key).await.unwrap();
        }

        assert!(h.pipeline.correlator().pending_messages().is_empty());
        assert_eq!(h.pipeline.correlator().outstanding_surbs(), 0);
        assert_eq!(h.storage.surb_count().await, 0);
        assert!(h.pipeline.queue().is_empty());
        assert!(waiters.iter().all(|w| *w.borrow() == ReplyStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_transport_error_retires_message() {
        let h = harness(100);
        h.transport.fail.store(true, Ordering::SeqCst);

        let err = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(h.pipeline.correlator().pending_messages().is_empty());
        assert!(h.pipeline.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_cancels_retransmission() {
        let mut h = harness(100);
        let (id, mut status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (surb, ack) = ack_for(&h.transport, 0);
        assert_eq!(
            h.pipeline.acknowledge(&surb, &ack).await.unwrap(),
            AckResult::Completed(id)
        );
        assert!(h.pipeline.queue().is_empty());
        assert_eq!(h.storage.surb_count().await, 0);

        status.changed().await.unwrap();
        assert!(matches!(*status.borrow(), ReplyStatus::Delivered(_)));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.fired.try_recv().is_err());
        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);

        // Duplicate
        assert_eq!(
            h.pipeline.acknowledge(&surb, &ack).await.unwrap(),
            AckResult::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_ack_keeps_block_pending() {
        let h = harness(100);
        h.pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();

        let (surb, keys) = {
            let sent = h.transport.sent.lock().unwrap();
            (sent[0].0, sent[0].1.clone())
        };
        let bogus = keys.seal_payload(b"\x01nonzero").unwrap();
        assert_eq!(
            h.pipeline.acknowledge(&surb, &bogus).await.unwrap(),
            AckResult::Invalid
        );
        assert_eq!(h.pipeline.queue().len(), 1);
        assert_eq!(h.pipeline.correlator().pending_messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_until_abandoned() {
        let mut h = harness(100);
        let start = Instant::now();
        let (_, status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();

        for _ in 0..3 {
            let key = h.fired.recv().await.unwrap();
            h.pipeline.on_deadline(&key).await.unwrap();
        }

        let sends: Vec<Duration> = h
            .transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, at)| *at - start)
            .collect();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[1].as_secs(), 3);
        assert_eq!(sends[2].as_secs(), 8);
        assert!(Instant::now() - start >= Duration::from_secs(15));
        assert_eq!(*status.borrow(), ReplyStatus::Failed);
        assert!(h.pipeline.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retransmission_counts_attempt() {
        let mut h = harness(100);
        let (id, _status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();
        h.transport.fail.store(true, Ordering::SeqCst);

        let QueueKey::Block(key) = h.fired.recv().await.unwrap() else {
            panic!("expected a block deadline");
        };
        h.pipeline.retransmit(&key).await.unwrap();
        let block = h.pipeline.correlator().block(&key).unwrap();
        assert_eq!(block.transmissions, 2);
        assert_eq!(h.pipeline.queue().len(), 1);

        for _ in 0..2 {
            let key = h.fired.recv().await.unwrap();
            h.pipeline.on_deadline(&key).await.unwrap();
        }
        assert!(!h.pipeline.correlator().pending_messages().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decoy_ack_recognised() {
        let h = harness(100);
        let target = ServiceAddress::new("loop", "acme.net");
        let surb = h.pipeline.send_decoy(&target).await.unwrap();

        assert_eq!(h.pipeline.queue().len(), 1);
        assert_eq!(
            h.pipeline.acknowledge(&surb, &[]).await.unwrap(),
            AckResult::Decoy
        );
        assert!(h.pipeline.queue().is_empty());
        assert_eq!(h.pipeline.correlator().outstanding_surbs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_egress_record_tracks_current_surb() {
        let mut h = harness(100);
        h.pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();

        let first = h.transport.sent.lock().unwrap()[0].0;
        let records = h.storage.egress_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].surb_id, Some(first));
        assert!(records[0].expiration.is_some());

        let key = h.fired.recv().await.unwrap();
        h.pipeline.on_deadline(&key).await.unwrap();
        let second = h.transport.sent.lock().unwrap()[1].0;
        let records = h.storage.egress_records().await.unwrap();
        assert_eq!(records[0].surb_id, Some(second));
    }

    /// Records the reply status each time egress records are removed
    struct ObservingStorage {
        inner: MemoryStorage,
        correlator: Mutex<Option<Arc<Correlator>>>,
        seen: Mutex<Vec<ReplyStatus>>,
        message: Mutex<Option<MessageId>>,
    }

    #[async_trait]
    impl Storage for ObservingStorage {
        async fn get_fragments(&self, message_id: &MessageId) -> std::result::Result<Vec<Vec<u8>>, StorageError> {
            self.inner.get_fragments(message_id).await
        }

        async fn put_fragment(&self, message_id: &MessageId, raw: Vec<u8>) -> std::result::Result<(), StorageError> {
            self.inner.put_fragment(message_id, raw).await
        }

        async fn remove_fragments(&self, message_id: &MessageId) -> std::result::Result<(), StorageError> {
            self.inner.remove_fragments(message_id).await
        }

        async fn put_egress(&self, record: &EgressRecord) -> std::result::Result<(), StorageError> {
            self.inner.put_egress(record).await
        }

        async fn remove_egress(&self, message_id: &MessageId) -> std::result::Result<(), StorageError> {
            let correlator = self.correlator.lock().unwrap().clone();
            if let Some(correlator) = correlator {
                let status = correlator.subscribe(message_id).unwrap();
                self.seen.lock().unwrap().push(status.borrow().clone());
            }
            *self.message.lock().unwrap() = Some(*message_id);
            self.inner.remove_egress(message_id).await
        }

        async fn egress_records(&self) -> std::result::Result<Vec<EgressRecord>, StorageError> {
            self.inner.egress_records().await
        }

        async fn add_surb_keys(&self, record: &SurbKeyRecord) -> std::result::Result<(), StorageError> {
            self.inner.add_surb_keys(record).await
        }

        async fn remove_surb_keys(&self, surb_id: &SurbId) -> std::result::Result<(), StorageError> {
            self.inner.remove_surb_keys(surb_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_cleaned_before_delivery_published() {
        let memory = MemoryStorage::new();
        let observing = Arc::new(ObservingStorage {
            inner: memory.clone(),
            correlator: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
            message: Mutex::new(None),
        });
        let h = harness_with_storage(100, memory, observing.clone());
        *observing.correlator.lock().unwrap() = Some(h.pipeline.correlator().clone());

        let (id, status) = h
            .pipeline
            .submit("bob", "acme.net", &h.recipient, b"hi", true)
            .await
            .unwrap();
        let (surb, ack) = ack_for(&h.transport, 0);
        assert_eq!(
            h.pipeline.acknowledge(&surb, &ack).await.unwrap(),
            AckResult::Completed(id)
        );

        assert_eq!(*observing.message.lock().unwrap(), Some(id));
        assert_eq!(*observing.seen.lock().unwrap(), vec![ReplyStatus::Pending]);
        assert!(matches!(*status.borrow(), ReplyStatus::Delivered(_)));
        assert!(h.storage.egress_records().await.unwrap().is_empty());
    }
}
