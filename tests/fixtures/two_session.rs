//! Two-session test fixture for integration testing
//!
//! Wires two sessions to one [`LoopbackMixnet`] with a shared key
//! directory, so tests can exercise:
//! - End-to-end reliable delivery
//! - Retransmission under loss
//! - Shutdown and failure reporting
//!
//! # Example
//!
//! ```ignore
//! use courier_core::LoopbackConfig;
//! use courier_integration_tests::fixtures::TwoSessionFixture;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_basic_delivery() {
//!     let fixture = TwoSessionFixture::new(LoopbackConfig::default()).await.unwrap();
//!     let id = fixture.send(b"hello").await.unwrap();
//!     fixture.alice.session.wait_for_reply(&id).await.unwrap();
//!     fixture.cleanup().await.unwrap();
//! }
//! ```

use courier_core::{
    Collaborators, IdentityCrypto, LoopbackConfig, LoopbackMixnet, MemoryStorage, MessageConsumer,
    MessageId, Result, Session, SessionConfig, StaticKeyDiscovery, Storage,
};
use courier_crypto::{PrivateKey, PublicKey};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Provider both fixture users live on
pub const PROVIDER: &str = "provider.test";

/// Consumer that records everything it is handed
#[derive(Default)]
pub struct RecordingConsumer {
    messages: Mutex<Vec<(PublicKey, Vec<u8>)>>,
    acks: Mutex<Vec<MessageId>>,
    notify: Notify,
}

impl RecordingConsumer {
    /// Messages received so far
    pub fn messages(&self) -> Vec<(PublicKey, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    /// Delivery notifications received so far
    pub fn acks(&self) -> Vec<MessageId> {
        self.acks.lock().unwrap().clone()
    }

    /// Wait until at least `count` messages have arrived
    pub async fn wait_for_messages(&self, count: usize) -> Vec<(PublicKey, Vec<u8>)> {
        loop {
            let notified = self.notify.notified();
            {
                let messages = self.messages.lock().unwrap();
                if messages.len() >= count {
                    return messages.clone();
                }
            }
            notified.await;
        }
    }
}

impl MessageConsumer for RecordingConsumer {
    fn received_message(&self, sender: PublicKey, plaintext: Vec<u8>) {
        self.messages.lock().unwrap().push((sender, plaintext));
        self.notify.notify_waiters();
    }

    fn received_ack(&self, message_id: MessageId) {
        self.acks.lock().unwrap().push(message_id);
        self.notify.notify_waiters();
    }
}

/// One side of the fixture
pub struct TestSession {
    /// User name on [`PROVIDER`]
    pub user: String,
    /// The running session
    pub session: Session,
    /// Everything the session delivered to the application
    pub consumer: Arc<RecordingConsumer>,
    /// Backing storage
    pub storage: Arc<dyn Storage>,
    /// Identity public key
    pub key: PublicKey,
}

/// Alice and Bob on a shared loopback network
pub struct TwoSessionFixture {
    /// Shared network
    pub mixnet: LoopbackMixnet,
    /// Sending side
    pub alice: TestSession,
    /// Receiving side
    pub bob: TestSession,
}

impl TwoSessionFixture {
    /// Both sessions with default configuration and in-memory storage
    pub async fn new(network: LoopbackConfig) -> Result<Self> {
        Self::with_config(network, |_| {}, |_| Arc::new(MemoryStorage::new())).await
    }

    /// Customize each session's configuration and storage before start
    pub async fn with_config(
        network: LoopbackConfig,
        configure: impl Fn(&mut SessionConfig),
        storage: impl Fn(&str) -> Arc<dyn Storage>,
    ) -> Result<Self> {
        let mixnet = LoopbackMixnet::new(network);
        let alice_key = PrivateKey::random();
        let bob_key = PrivateKey::random();

        let mut directory = StaticKeyDiscovery::new();
        directory.insert("alice", PROVIDER, alice_key.public_key());
        directory.insert("bob", PROVIDER, bob_key.public_key());
        let directory = Arc::new(directory);

        let alice = start(&mixnet, &directory, "alice", alice_key, &configure, &storage).await?;
        let bob = start(&mixnet, &directory, "bob", bob_key, &configure, &storage).await?;

        Ok(Self { mixnet, alice, bob })
    }

    /// Send `payload` reliably from Alice to Bob
    pub async fn send(&self, payload: &[u8]) -> Result<MessageId> {
        self.alice.session.send("bob", PROVIDER, payload).await
    }

    /// Shut both sessions down and detach them
    pub async fn cleanup(self) -> Result<()> {
        self.alice.session.shutdown().await?;
        self.bob.session.shutdown().await?;
        self.mixnet.detach("alice", PROVIDER).await;
        self.mixnet.detach("bob", PROVIDER).await;
        Ok(())
    }
}

async fn start(
    mixnet: &LoopbackMixnet,
    directory: &Arc<StaticKeyDiscovery>,
    user: &str,
    identity: PrivateKey,
    configure: &impl Fn(&mut SessionConfig),
    storage: &impl Fn(&str) -> Arc<dyn Storage>,
) -> Result<TestSession> {
    let mut config = SessionConfig::new(user, PROVIDER);
    configure(&mut config);

    let key = identity.public_key();
    let consumer = Arc::new(RecordingConsumer::default());
    let storage = storage(user);

    let session = Session::new(
        config,
        Collaborators {
            transport: Arc::new(mixnet.endpoint(user, PROVIDER)),
            crypto: Arc::new(IdentityCrypto::new(identity)),
            key_discovery: directory.clone(),
            storage: storage.clone(),
            consumer: consumer.clone(),
        },
    )?;
    mixnet.attach(user, PROVIDER, session.events()).await;
    session.wait_for_connection().await?;

    Ok(TestSession {
        user: user.to_string(),
        session,
        consumer,
        storage,
        key,
    })
}
