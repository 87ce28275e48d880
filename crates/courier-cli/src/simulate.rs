//! Two sessions exchanging messages over the in-process loopback mix network.

use crate::config::Config;
use crate::progress::DeliveryProgress;
use courier_core::{
    Collaborators, FileStorage, IdentityCrypto, LoopbackMixnet, LoopbackStats, MemoryStorage,
    MessageConsumer, MessageId, Session, StaticKeyDiscovery, Storage,
};
use courier_crypto::{PrivateKey, PublicKey};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Messages fully acknowledged
    pub delivered: usize,
    /// Messages that exhausted their retry budget or failed to send
    pub failed: usize,
    /// Messages reassembled by the peer
    pub received: usize,
    /// Plaintext bytes reassembled by the peer
    pub received_bytes: u64,
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Loopback packet counters
    pub network: LoopbackStats,
}

/// Counts what a session hands to the application
#[derive(Default)]
struct CountingConsumer {
    messages: AtomicUsize,
    bytes: AtomicU64,
    acks: AtomicUsize,
}

impl MessageConsumer for CountingConsumer {
    fn received_message(&self, sender: PublicKey, plaintext: Vec<u8>) {
        tracing::debug!("Received {} bytes from {:?}", plaintext.len(), sender);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(plaintext.len() as u64, Ordering::Relaxed);
    }

    fn received_ack(&self, message_id: MessageId) {
        tracing::debug!("Message {} acknowledged", message_id);
        self.acks.fetch_add(1, Ordering::Relaxed);
    }
}

struct Peer {
    session: Session,
    consumer: Arc<CountingConsumer>,
}

async fn open_storage(config: &Config, user: &str) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match &config.session.storage_dir {
        Some(dir) => Arc::new(FileStorage::open(dir.join(user)).await?),
        None => Arc::new(MemoryStorage::new()),
    })
}

async fn start_peer(
    config: &Config,
    mixnet: &LoopbackMixnet,
    directory: &Arc<StaticKeyDiscovery>,
    user: &str,
    identity: PrivateKey,
) -> anyhow::Result<Peer> {
    let provider = config.session.provider.as_str();
    let consumer = Arc::new(CountingConsumer::default());

    let session = Session::new(
        config.session_config_for(user)?,
        Collaborators {
            transport: Arc::new(mixnet.endpoint(user, provider)),
            crypto: Arc::new(IdentityCrypto::new(identity)),
            key_discovery: directory.clone(),
            storage: open_storage(config, user).await?,
            consumer: consumer.clone(),
        },
    )?;

    mixnet.attach(user, provider, session.events()).await;
    session.wait_for_connection().await?;
    tracing::info!("{}@{} connected", user, provider);

    Ok(Peer { session, consumer })
}

/// Run a simulation described by `config`.
///
/// `identity` is the sending user's key; a fresh one is generated when
/// absent. The peer always gets a fresh key.
///
/// # Errors
///
/// Returns an error if a session cannot be started.
pub async fn run(
    config: &Config,
    identity: Option<PrivateKey>,
    progress: &DeliveryProgress,
) -> anyhow::Result<SimulationReport> {
    let started = tokio::time::Instant::now();
    let sim = &config.simulation;
    let provider = config.session.provider.clone();

    let mixnet = LoopbackMixnet::new(config.loopback());
    if let Some(service) = config.loop_service()? {
        mixnet.add_loop_service(&service);
    }

    let sender_key = identity.unwrap_or_else(PrivateKey::random);
    let peer_key = PrivateKey::random();

    let mut directory = StaticKeyDiscovery::new();
    directory.insert(&config.session.user, &provider, sender_key.public_key());
    directory.insert(&sim.peer, &provider, peer_key.public_key());
    let directory = Arc::new(directory);

    let sender = start_peer(config, &mixnet, &directory, &config.session.user, sender_key).await?;
    let peer = start_peer(config, &mixnet, &directory, &sim.peer, peer_key).await?;

    tracing::info!(
        "Sending {} messages of {} bytes from {} to {}",
        sim.messages,
        sim.message_size,
        config.session.user,
        sim.peer
    );

    let mut tasks = JoinSet::new();
    for _ in 0..sim.messages {
        let session = sender.session.clone();
        let recipient = sim.peer.clone();
        let provider = provider.clone();
        let mut payload = vec![0u8; sim.message_size];
        rand::thread_rng().fill_bytes(&mut payload);

        tasks.spawn(async move {
            let message_id = session.send(&recipient, &provider, &payload).await?;
            session.wait_for_reply(&message_id).await.map(|_| message_id)
        });
    }

    let mut delivered = 0;
    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(message_id)) => {
                tracing::debug!("Delivered {}", message_id);
                delivered += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!("Message failed: {}", e);
                failed += 1;
            }
            Err(e) => {
                tracing::error!("Send task panicked: {}", e);
                failed += 1;
            }
        }
        progress.settled(delivered, failed);
    }

    // Let the last inbound blocks reach the peer's consumer.
    tokio::time::sleep(config.loopback().eta()).await;

    sender.session.shutdown().await?;
    peer.session.shutdown().await?;
    mixnet.detach(&config.session.user, &provider).await;
    mixnet.detach(&sim.peer, &provider).await;

    if sender.consumer.acks.load(Ordering::Relaxed) != delivered {
        tracing::warn!("ACK notifications disagree with delivered count");
    }

    Ok(SimulationReport {
        delivered,
        failed,
        received: peer.consumer.messages.load(Ordering::Relaxed),
        received_bytes: peer.consumer.bytes.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
        network: mixnet.stats(),
    })
}
