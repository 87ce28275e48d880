//! Session - the client-facing reliable-delivery API
//!
//! A session owns the send pipeline, the reassembler and one dispatch loop.
//! The loop consumes transport events and retransmission deadlines one at a
//! time, so an ACK and a retransmission of the same block never interleave.
//! `send` runs on the caller's task and meets the loop only through the
//! correlator.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Collaborators, Session, SessionConfig};
//!
//! # async fn example(collaborators: Collaborators) -> courier_core::Result<()> {
//! let session = Session::new(SessionConfig::new("alice", "acme.net"), collaborators)?;
//! session.wait_for_connection().await?;
//!
//! let id = session.send("bob", "acme.net", b"hello").await?;
//! session.wait_for_reply(&id).await?;
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::block::{Block, IngressFragment};
use crate::config::{CoverTrafficConfig, CoverTrafficDistribution, SessionConfig};
use crate::correlator::{Correlator, ReplyStatus};
use crate::crypto::MessageCrypto;
use crate::delay_queue::DelayQueue;
use crate::error::{Error, Result};
use crate::ids::{MessageId, QueueKey, SurbId};
use crate::pipeline::{AckResult, SendPipeline};
use crate::reassembly::Reassembler;
use crate::storage::Storage;
use crate::transport::{KeyDiscovery, MessageConsumer, Transport, TransportEvent};
use courier_crypto::PublicKey;
use rand_distr::{Distribution, Exp};
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// External collaborators a session is wired to
#[derive(Clone)]
pub struct Collaborators {
    /// Mix-network transport
    pub transport: Arc<dyn Transport>,
    /// Block sealing and ACK decryption
    pub crypto: Arc<dyn MessageCrypto>,
    /// Recipient key lookup
    pub key_discovery: Arc<dyn KeyDiscovery>,
    /// Fragment, egress and SURB key persistence
    pub storage: Arc<dyn Storage>,
    /// Receives completed messages and delivery notifications
    pub consumer: Arc<dyn MessageConsumer>,
}

/// Session inner state
pub(crate) struct SessionInner {
    /// Session configuration
    pub(crate) config: SessionConfig,
    /// Outbound side
    pub(crate) pipeline: SendPipeline,
    /// Block opening
    pub(crate) crypto: Arc<dyn MessageCrypto>,
    /// Transport, closed on shutdown
    pub(crate) transport: Arc<dyn Transport>,
    /// Recipient key lookup
    pub(crate) key_discovery: Arc<dyn KeyDiscovery>,
    /// Application sink
    pub(crate) consumer: Arc<dyn MessageConsumer>,
    /// Session running state
    pub(crate) running: AtomicBool,
    /// Provider connection state
    pub(crate) connected: watch::Sender<bool>,
    /// Stops the dispatch and cover traffic loops
    pub(crate) shutdown_tx: watch::Sender<bool>,
    /// Handed to the transport for inbound events
    pub(crate) events_tx: mpsc::Sender<TransportEvent>,
}

/// Reliable-delivery session for one local user
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session and start its background tasks.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration is rejected.
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let (deadline_tx, deadline_rx) = mpsc::channel(config.event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connected, _) = watch::channel(false);

        let pipeline = SendPipeline::new(
            Arc::new(Correlator::new()),
            Arc::clone(&collaborators.transport),
            Arc::clone(&collaborators.crypto),
            Arc::clone(&collaborators.storage),
            DelayQueue::new(deadline_tx),
            config.arq,
            config.block_payload_len,
        );
        let reassembler = Reassembler::new(collaborators.storage, config.completed_cache);

        let inner = Arc::new(SessionInner {
            config,
            pipeline,
            crypto: collaborators.crypto,
            transport: collaborators.transport,
            key_discovery: collaborators.key_discovery,
            consumer: collaborators.consumer,
            running: AtomicBool::new(true),
            connected,
            shutdown_tx,
            events_tx,
        });

        tokio::spawn(dispatch_loop(
            Arc::clone(&inner),
            events_rx,
            deadline_rx,
            reassembler,
            shutdown_rx.clone(),
        ));

        if inner.config.cover_traffic.enabled {
            tokio::spawn(cover_traffic_loop(Arc::clone(&inner), shutdown_rx));
        }

        tracing::info!(
            "Session started for {}@{} ({})",
            inner.config.user,
            inner.config.provider,
            inner.crypto.local_key()
        );
        Ok(Self { inner })
    }

    /// Sender the transport pushes inbound events on
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<TransportEvent> {
        self.inner.events_tx.clone()
    }

    /// Local identity key
    #[must_use]
    pub fn local_key(&self) -> PublicKey {
        self.inner.crypto.local_key()
    }

    /// Check if the session is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the transport last reported a live provider connection
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait until the transport reports a connection, bounded by
    /// `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if no connection is reported in time and
    /// `Error::Shutdown` if the session stops first.
    pub async fn wait_for_connection(&self) -> Result<()> {
        self.ensure_running()?;
        let mut connected = self.inner.connected.subscribe();
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        let up = async { connected.wait_for(|up| *up).await.map(|_| ()) };
        let stopped = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) };

        tokio::select! {
            result = tokio::time::timeout(self.inner.config.connect_timeout, up) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Shutdown),
                Err(_) => Err(Error::timeout("waiting for provider connection")),
            },
            _ = stopped => Err(Error::Shutdown),
        }
    }

    /// Send `payload` reliably; retransmitted until acknowledged or the
    /// retry budget runs out.
    ///
    /// # Errors
    ///
    /// Returns an error if key discovery, composition or the first
    /// transmission of any block fails.
    pub async fn send(&self, recipient: &str, provider: &str, payload: &[u8]) -> Result<MessageId> {
        self.submit(recipient, provider, payload, true).await
    }

    /// Send `payload` once with no retransmission. ACKs are still matched
    /// and reported; without one the message fails once the window a
    /// reliable send would have used has passed.
    ///
    /// # Errors
    ///
    /// Fails fast on any transport error.
    pub async fn send_unreliable(
        &self,
        recipient: &str,
        provider: &str,
        payload: &[u8],
    ) -> Result<MessageId> {
        self.submit(recipient, provider, payload, false).await
    }

    async fn submit(
        &self,
        recipient: &str,
        provider: &str,
        payload: &[u8],
        reliable: bool,
    ) -> Result<MessageId> {
        self.ensure_running()?;
        let recipient_key = self
            .inner
            .key_discovery
            .get(recipient, provider)
            .await
            .map_err(|e| Error::KeyDiscovery(Cow::Owned(e)))?;

        let (message_id, _) = self
            .inner
            .pipeline
            .submit(recipient, provider, &recipient_key, payload, reliable)
            .await?;
        Ok(message_id)
    }

    /// Wait until every block of `message_id` is acknowledged.
    ///
    /// Returns the plaintext of the final ACK. Wrap in
    /// `tokio::time::timeout` to bound the wait.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeliveryFailed` when the retry budget is exhausted or
    /// an unreliable message expires unacknowledged, `Error::Shutdown` if the session stops first, or
    /// `Error::UnknownMessage` for an id this session does not know.
    pub async fn wait_for_reply(&self, message_id: &MessageId) -> Result<Vec<u8>> {
        let mut status = self.inner.pipeline.correlator().subscribe(message_id)?;
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                ReplyStatus::Pending => {}
                ReplyStatus::Delivered(plaintext) => return Ok(plaintext),
                ReplyStatus::Failed => return Err(Error::DeliveryFailed(*message_id)),
                ReplyStatus::Shutdown => return Err(Error::Shutdown),
            }
            if status.changed().await.is_err() {
                return Err(Error::Shutdown);
            }
        }
    }

    /// Send one loop decoy to the configured loop service
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if no loop service is configured, or
    /// the transport error.
    pub async fn send_loop_decoy(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.send_loop_decoy().await
    }

    /// Messages with unacknowledged blocks
    #[must_use]
    pub fn pending_messages(&self) -> Vec<MessageId> {
        self.inner.pipeline.correlator().pending_messages()
    }

    /// Stop the session.
    ///
    /// Stops the dispatch loop, the retransmission queue and cover traffic,
    /// closes the transport and releases every `wait_for_reply` caller with
    /// `Error::Shutdown`. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if shared state is poisoned.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        self.inner.shutdown_tx.send_replace(true);
        self.inner.pipeline.shutdown()?;
        self.inner.connected.send_replace(false);

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }

        tracing::info!("Session stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Event Handling
// ═══════════════════════════════════════════════════════════════════════════

impl SessionInner {
    async fn send_loop_decoy(&self) -> Result<()> {
        let target = self
            .config
            .loop_service
            .as_ref()
            .ok_or(Error::invalid_config("no loop service configured"))?;
        self.pipeline.send_decoy(target).await.map(|_| ())
    }

    fn handle_connected(&self, up: bool) {
        let changed = self.connected.send_replace(up) != up;
        if changed {
            if up {
                tracing::info!("Connected to provider {}", self.config.provider);
            } else {
                tracing::warn!("Lost connection to provider {}", self.config.provider);
            }
        }
    }

    async fn handle_message(&self, reassembler: &mut Reassembler, ciphertext: &[u8]) {
        let (sender, plaintext) = match self.crypto.open_block(ciphertext) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("Dropping undecryptable block: {}", e);
                return;
            }
        };
        let block = match Block::from_bytes(&plaintext) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!("Dropping malformed block from {:?}: {}", sender, e);
                return;
            }
        };
        tracing::debug!(
            "Received block {}/{} of message {} from {:?}",
            block.block_id,
            block.total_blocks,
            block.message_id,
            sender
        );

        match reassembler.ingest(IngressFragment { sender, block }).await {
            Ok(Some(message)) => {
                tracing::info!(
                    "Received message {} ({} bytes)",
                    message.message_id,
                    message.payload.len()
                );
                self.consumer.received_message(message.sender, message.payload);
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Rejected inbound fragment: {}", e),
        }
    }

    async fn handle_ack(&self, surb_id: &SurbId, payload: &[u8]) -> Result<()> {
        if let AckResult::Completed(message_id) = self.pipeline.acknowledge(surb_id, payload).await? {
            self.consumer.received_ack(message_id);
        }
        Ok(())
    }

    async fn handle_deadline(&self, key: &QueueKey) -> Result<()> {
        self.pipeline.on_deadline(key).await
    }
}

/// Sequentially handles transport events and delay queue deadlines
async fn dispatch_loop(
    inner: Arc<SessionInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut deadlines: mpsc::Receiver<QueueKey>,
    mut reassembler: Reassembler,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::debug!("Dispatch loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            Some(event) = events.recv() => match event {
                TransportEvent::Connected(up) => {
                    inner.handle_connected(up);
                    Ok(())
                }
                TransportEvent::Message(ciphertext) => {
                    inner.handle_message(&mut reassembler, &ciphertext).await;
                    Ok(())
                }
                TransportEvent::Ack { surb_id, payload } => {
                    inner.handle_ack(&surb_id, &payload).await
                }
            },
            Some(key) = deadlines.recv() => inner.handle_deadline(&key).await,
            else => break,
        };

        if let Err(e) = result {
            tracing::error!("Dispatch loop error: {}", e);
            if e.is_permanent() {
                break;
            }
        }
    }

    tracing::debug!("Dispatch loop stopped");
}

/// Delay until the next cover traffic decoy
fn next_cover_delay(config: &CoverTrafficConfig) -> Duration {
    let mean = config.mean_interval;
    match config.distribution {
        CoverTrafficDistribution::Constant => mean,
        CoverTrafficDistribution::Poisson => {
            let Ok(exp) = Exp::new(1.0 / mean.as_secs_f64()) else {
                return mean;
            };
            let sample: f64 = exp.sample(&mut rand::thread_rng());
            Duration::from_secs_f64(sample.min(mean.as_secs_f64() * 10.0))
        }
    }
}

/// Periodically sends loop decoys until shutdown
async fn cover_traffic_loop(inner: Arc<SessionInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let delay = next_cover_delay(&inner.config.cover_traffic);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }

        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = inner.send_loop_decoy().await {
            tracing::debug!("Cover traffic decoy failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_cover_delay() {
        let config = CoverTrafficConfig {
            enabled: true,
            mean_interval: Duration::from_millis(250),
            distribution: CoverTrafficDistribution::Constant,
        };
        assert_eq!(next_cover_delay(&config), Duration::from_millis(250));
    }

    #[test]
    fn test_poisson_cover_delay_bounded() {
        let config = CoverTrafficConfig {
            enabled: true,
            mean_interval: Duration::from_secs(1),
            distribution: CoverTrafficDistribution::Poisson,
        };
        for _ in 0..1000 {
            assert!(next_cover_delay(&config) <= Duration::from_secs(10));
        }
    }
}
