//! # Courier Core
//!
//! Client-side reliable delivery over an anonymous, unreliable mix network.
//!
//! This crate provides:
//! - SURB-based automatic repeat request (ARQ) with deadline-driven
//!   retransmission
//! - Correlation of acknowledgments with in-flight blocks
//! - Fragmentation of large payloads and out-of-order reassembly
//! - A session API tying these to a transport, key discovery and storage
//! - An in-process loopback mix network for simulation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                 │
//! │   send / wait_for_reply / send_loop_decoy / dispatch loop       │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │         SendPipeline          │          Reassembler            │
//! │   (compose, transmit, ACKs)   │   (fragments → messages)        │
//! ├───────────────┬───────────────┼─────────────────────────────────┤
//! │  Correlator   │  DelayQueue   │          Storage                │
//! │ (SURB → block)│ (deadlines)   │   (fragments, egress, SURBs)    │
//! └───────────────┴───────────────┴─────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod block;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod delay_queue;
pub mod error;
pub mod ids;
pub mod loopback;
pub mod pipeline;
pub mod reassembly;
pub mod session;
pub mod storage;
pub mod transport;

pub use block::{Block, BlockError, IngressFragment, fragment};
pub use config::{ArqPolicy, CoverTrafficConfig, CoverTrafficDistribution, ServiceAddress, SessionConfig};
pub use correlator::{Correlator, PendingMessage, ReplyStatus};
pub use crypto::{IdentityCrypto, MessageCrypto};
pub use delay_queue::{DelayQueue, QueueError};
pub use error::{Error, Result};
pub use ids::{BlockKey, MessageId, QueueKey, SurbId};
pub use loopback::{LoopbackConfig, LoopbackMixnet, LoopbackStats, LoopbackTransport};
pub use pipeline::{AckResult, SendPipeline};
pub use reassembly::{ReassemblyError, ReceivedMessage, Reassembler};
pub use session::{Collaborators, Session};
pub use storage::{EgressRecord, FileStorage, MemoryStorage, Storage, StorageError, SurbKeyRecord};
pub use transport::{
    KeyDiscovery, MessageConsumer, StaticKeyDiscovery, SurbReceipt, Transport, TransportError,
    TransportEvent,
};

/// Message identifier length in bytes
pub const MESSAGE_ID_LENGTH: usize = 16;

/// SURB identifier length in bytes
pub const SURB_ID_LENGTH: usize = 16;

/// Encoded block header: message id, block id, total, payload length
pub const BLOCK_HEADER_SIZE: usize = MESSAGE_ID_LENGTH + 2 + 2 + 4;

/// Encoded block length before sealing
pub const BLOCK_LENGTH: usize = 2048;

/// Default plaintext payload bytes per block
pub const DEFAULT_BLOCK_PAYLOAD: usize = BLOCK_LENGTH - BLOCK_HEADER_SIZE;

/// Plaintext length of an acknowledgment (all zeros)
pub const ACK_PAYLOAD_LENGTH: usize = 32;
