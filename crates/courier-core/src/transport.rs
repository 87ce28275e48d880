//! Collaborator interfaces at the edge of the reliable-delivery core.
//!
//! The mix-network transport, recipient key discovery and the application
//! consumer are external to this crate. The session talks to them through
//! the traits here, and the transport reports back by pushing
//! [`TransportEvent`]s onto the session's event channel.

use crate::ids::{MessageId, SurbId};
use async_trait::async_trait;
use courier_crypto::{PublicKey, SurbKey};
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// No route to the recipient's provider
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// Transport refused the packet
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// What the transport hands back for one transmission
#[derive(Debug, Clone)]
pub struct SurbReceipt {
    /// Key for opening the ACK that will come back on this SURB
    pub keys: SurbKey,
    /// Estimated round trip until that ACK
    pub eta: Duration,
}

/// Mix-network transport.
///
/// One call is one packet on the wire carrying a single-use reply block
/// identified by `surb_id`. Inbound traffic is not returned here; it arrives
/// as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a sealed block to `recipient` at `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet could not be handed to the network.
    async fn send_ciphertext(
        &self,
        recipient: &str,
        provider: &str,
        surb_id: &SurbId,
        payload: &[u8],
    ) -> TransportResult<SurbReceipt>;

    /// Close the transport; later sends fail with [`TransportError::Closed`]
    async fn close(&self) -> TransportResult<()>;
}

/// Recipient public key lookup
#[async_trait]
pub trait KeyDiscovery: Send + Sync {
    /// Resolve the identity key of `recipient` at `provider`
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if the user is unknown or the
    /// lookup failed.
    async fn get(&self, recipient: &str, provider: &str) -> Result<PublicKey, String>;
}

/// Application-side sink for completed deliveries.
///
/// Called from the session's dispatch loop; implementations should return
/// quickly.
pub trait MessageConsumer: Send + Sync {
    /// A complete inbound message has been reassembled
    fn received_message(&self, sender: PublicKey, plaintext: Vec<u8>);

    /// Every block of an outbound message has been acknowledged
    fn received_ack(&self, message_id: MessageId);
}

/// Inbound signals from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Provider connection state changed
    Connected(bool),
    /// Sealed block addressed to this client
    Message(Vec<u8>),
    /// Reply arrived on a SURB
    Ack {
        /// SURB the reply travelled on
        surb_id: SurbId,
        /// SURB-encrypted reply payload
        payload: Vec<u8>,
    },
}

/// Key discovery backed by a fixed directory, keyed by `recipient@provider`
#[derive(Debug, Default, Clone)]
pub struct StaticKeyDiscovery {
    keys: std::collections::HashMap<String, PublicKey>,
}

impl StaticKeyDiscovery {
    /// Empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user's key
    pub fn insert(&mut self, recipient: &str, provider: &str, key: PublicKey) {
        self.keys.insert(format!("{recipient}@{provider}"), key);
    }
}

#[async_trait]
impl KeyDiscovery for StaticKeyDiscovery {
    async fn get(&self, recipient: &str, provider: &str) -> Result<PublicKey, String> {
        self.keys
            .get(&format!("{recipient}@{provider}"))
            .copied()
            .ok_or_else(|| format!("no key for {recipient}@{provider}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_key_discovery() {
        let key = PublicKey::from_bytes([3u8; 32]);
        let mut directory = StaticKeyDiscovery::new();
        directory.insert("alice", "acme.net", key);

        assert_eq!(directory.get("alice", "acme.net").await, Ok(key));
        assert!(directory.get("alice", "other.net").await.is_err());
        assert!(directory.get("bob", "acme.net").await.is_err());
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Transport is closed");
        assert!(
            TransportError::UnknownDestination("bob@x".into())
                .to_string()
                .contains("bob@x")
        );
    }
}
