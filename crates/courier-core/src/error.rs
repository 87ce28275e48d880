//! Error types for the Courier core
//!
//! Errors are categorized to support caller-side retry decisions:
//!
//! - **Transient**: may succeed if repeated (transport hiccups, timeouts)
//! - **Permanent**: will not succeed without intervention (unknown message,
//!   exhausted retry budget, invalid configuration)
//!
//! Protocol violations seen on the receive path (bad ACKs, inconsistent
//! fragments) are logged by the session and never surface here.

use crate::block::BlockError;
use crate::delay_queue::QueueError;
use crate::ids::MessageId;
use crate::storage::StorageError;
use crate::transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Courier session operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    // ============ Send Path Errors ============
    /// The transport rejected a transmission
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Recipient key lookup failed
    #[error("Key discovery failed: {0}")]
    KeyDiscovery(Cow<'static, str>),

    /// Payload could not be split into blocks
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ============ Delivery Errors ============
    /// Retransmission budget exhausted without an acknowledgment
    #[error("Delivery failed for message {}", hex::encode(&.0.as_bytes()[..8]))]
    DeliveryFailed(MessageId),

    /// No such outbound message is being tracked
    #[error("Unknown message {}", hex::encode(&.0.as_bytes()[..8]))]
    UnknownMessage(MessageId),

    // ============ State Errors ============
    /// Delay queue invariant violated
    #[error("Delay queue error: {0}")]
    Queue(#[from] QueueError),

    /// Storage collaborator failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Shared state lock poisoned by a panicking thread
    #[error("State poisoned: {0}")]
    Poisoned(Cow<'static, str>),

    /// Session has been shut down
    #[error("Session shut down")]
    Shutdown,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl Error {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::UnknownMessage(_)
                | Error::DeliveryFailed(_)
                | Error::Shutdown
                | Error::Poisoned(_)
                | Error::Block(_)
                | Error::KeyDiscovery(_)
        )
    }

    /// Create a key discovery error with static context (zero allocation)
    #[must_use]
    pub const fn key_discovery(context: &'static str) -> Self {
        Error::KeyDiscovery(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a poisoned-state error with static context (zero allocation)
    #[must_use]
    pub const fn poisoned(context: &'static str) -> Self {
        Error::Poisoned(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Error::Timeout(Cow::Borrowed(context))
    }
}

impl From<courier_crypto::CryptoError> for Error {
    fn from(err: courier_crypto::CryptoError) -> Self {
        Error::Crypto(err.to_string())
    }
}

/// Result type for Courier core operations
pub type Result<T> = std::result::Result<T, Error>;
