//! In-process mix network for simulation and tests.
//!
//! Every attached client has a mailbox keyed by `user@provider`. A send is
//! delivered to the recipient's mailbox after a sampled one-way latency, and
//! an acknowledgment sealed with the transmission's SURB key travels back to
//! the sender after another. Either leg may be dropped with the configured
//! loss probability.

use crate::config::ServiceAddress;
use crate::ids::SurbId;
use crate::transport::{SurbReceipt, Transport, TransportError, TransportEvent, TransportResult};
use crate::ACK_PAYLOAD_LENGTH;
use async_trait::async_trait;
use courier_crypto::SurbKey;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Loopback network behaviour
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Base one-way latency
    pub latency: Duration,
    /// Uniform extra one-way latency in `0..=jitter`
    pub jitter: Duration,
    /// Probability that a message or an ACK is dropped
    pub loss: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter: Duration::from_millis(20),
            loss: 0.0,
        }
    }
}

impl LoopbackConfig {
    /// Round trip the transport reports as the reply ETA
    #[must_use]
    pub fn eta(&self) -> Duration {
        (self.latency + self.jitter) * 2
    }
}

/// Loopback traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Packets accepted from senders
    pub sent: u64,
    /// Packets handed to a mailbox or loop service
    pub delivered: u64,
    /// Packets or ACKs dropped by simulated loss
    pub dropped: u64,
    /// ACKs returned to senders
    pub acked: u64,
}

enum Mailbox {
    Client(mpsc::Sender<TransportEvent>),
    Service,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    acked: AtomicU64,
}

struct MixnetInner {
    config: LoopbackConfig,
    mailboxes: DashMap<String, Mailbox>,
    counters: Counters,
}

/// Shared in-process network
#[derive(Clone)]
pub struct LoopbackMixnet {
    inner: Arc<MixnetInner>,
}

fn address(user: &str, provider: &str) -> String {
    format!("{user}@{provider}")
}

impl LoopbackMixnet {
    /// Create a network; `loss` is clamped to `0.0..=1.0`
    #[must_use]
    pub fn new(mut config: LoopbackConfig) -> Self {
        config.loss = if config.loss.is_finite() {
            config.loss.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            inner: Arc::new(MixnetInner {
                config,
                mailboxes: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Transport handle sending as `user@provider`
    #[must_use]
    pub fn endpoint(&self, user: &str, provider: &str) -> LoopbackTransport {
        LoopbackTransport {
            mixnet: self.clone(),
            address: address(user, provider),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a client mailbox and report it as connected
    pub async fn attach(&self, user: &str, provider: &str, events: mpsc::Sender<TransportEvent>) {
        let address = address(user, provider);
        if events.send(TransportEvent::Connected(true)).await.is_err() {
            tracing::warn!("Mailbox {} closed before attach", address);
            return;
        }
        tracing::debug!("Attached mailbox {}", address);
        self.inner.mailboxes.insert(address, Mailbox::Client(events));
    }

    /// Detach a client mailbox and report it as disconnected
    pub async fn detach(&self, user: &str, provider: &str) {
        let key = address(user, provider);
        if let Some((_, Mailbox::Client(events))) = self.inner.mailboxes.remove(&key) {
            let _ = events.send(TransportEvent::Connected(false)).await;
            tracing::debug!("Detached mailbox {}", key);
        }
    }

    /// Register a loop service that swallows messages and acknowledges them
    pub fn add_loop_service(&self, service: &ServiceAddress) {
        self.inner
            .mailboxes
            .insert(service.to_string(), Mailbox::Service);
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        let c = &self.inner.counters;
        LoopbackStats {
            sent: c.sent.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
        }
    }

    fn sample_leg(&self) -> Option<Duration> {
        let config = &self.inner.config;
        let mut rng = rand::thread_rng();
        if config.loss > 0.0 && rng.gen_bool(config.loss) {
            return None;
        }
        let jitter_ms = u64::try_from(config.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Some(config.latency + extra)
    }

    fn client(&self, address: &str) -> Option<mpsc::Sender<TransportEvent>> {
        match self.inner.mailboxes.get(address)?.value() {
            Mailbox::Client(events) => Some(events.clone()),
            Mailbox::Service => None,
        }
    }

    async fn deliver(self, packet: Packet) {
        let Packet {
            from,
            to,
            surb_id,
            keys,
            payload,
            outbound,
            inbound,
        } = packet;
        let counters = &self.inner.counters;
        let Some(outbound) = outbound else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Loopback dropped packet to {}", to);
            return;
        };
        tokio::time::sleep(outbound).await;

        if let Some(events) = self.client(&to) {
            if events.send(TransportEvent::Message(payload)).await.is_err() {
                tracing::debug!("Mailbox {} gone; packet lost", to);
                return;
            }
        } else if !self.inner.mailboxes.contains_key(&to) {
            tracing::debug!("Mailbox {} detached; packet lost", to);
            return;
        }
        counters.delivered.fetch_add(1, Ordering::Relaxed);

        let Some(inbound) = inbound else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Loopback dropped ACK to {}", from);
            return;
        };
        tokio::time::sleep(inbound).await;

        let ack = match keys.seal_payload(&[0u8; ACK_PAYLOAD_LENGTH]) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!("Failed to seal loopback ACK: {}", e);
                return;
            }
        };
        if let Some(events) = self.client(&from) {
            if events
                .send(TransportEvent::Ack {
                    surb_id,
                    payload: ack,
                })
                .await
                .is_ok()
            {
                counters.acked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// One packet in transit, with its sampled leg latencies (`None` = lost)
struct Packet {
    from: String,
    to: String,
    surb_id: SurbId,
    keys: SurbKey,
    payload: Vec<u8>,
    outbound: Option<Duration>,
    inbound: Option<Duration>,
}

/// Transport for one client on a [`LoopbackMixnet`]
pub struct LoopbackTransport {
    mixnet: LoopbackMixnet,
    address: String,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_ciphertext(
        &self,
        recipient: &str,
        provider: &str,
        surb_id: &SurbId,
        payload: &[u8],
    ) -> TransportResult<SurbReceipt> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let to = address(recipient, provider);
        if !self.mixnet.inner.mailboxes.contains_key(&to) {
            return Err(TransportError::UnknownDestination(to));
        }

        let keys = SurbKey::generate();
        let outbound = self.mixnet.sample_leg();
        let inbound = self.mixnet.sample_leg();
        self.mixnet
            .inner
            .counters
            .sent
            .fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.mixnet.clone().deliver(Packet {
            from: self.address.clone(),
            to,
            surb_id: *surb_id,
            keys: keys.clone(),
            payload: payload.to_vec(),
            outbound,
            inbound,
        }));

        Ok(SurbReceipt {
            keys,
            eta: self.mixnet.inner.config.eta(),
        })
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
