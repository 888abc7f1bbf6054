//! # Shared transport building blocks
//!
//! Everything the client and server agree on lives here:
//!
//! - [`frame`]: the marker-prefixed wire frame and its stream records
//! - [`protocol`]: the [`Envelope`] vocabulary carried inside frames
//! - [`connection_id`]: the server-assigned 128-bit connection identity
//! - [`outbound`]: the bounded outbound queue and its sender loop
//! - [`service`]: the start/stop lifecycle used by every long-running component
//! - [`error`]: the [`NetError`] taxonomy
//!
//! Nothing in this crate keeps process-wide state; every queue and registry
//! is owned by the transport instance that created it.

pub mod connection_id;
pub mod error;
pub mod frame;
pub mod outbound;
pub mod protocol;
pub mod service;

pub use connection_id::ConnectionId;
pub use error::{NetError, Result};
pub use outbound::{OutboundQueue, OutboundReceiver};
pub use protocol::{Color, EntityKind, EntityUpdate, Envelope, InputSnapshot};
pub use service::{Lifecycle, ServiceState};

/// Port the host listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 1666;

/// Outbound queue capacity used by both binaries
pub const DEFAULT_MAX_OUTGOING: usize = 100;

/// Message pulled from a transport's inbound queue.
///
/// The consumer owns the payload; the queue keeps no reference to it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: ConnectionId,
    pub payload: bytes::Bytes,
}

impl InboundMessage {
    pub fn new(source: ConnectionId, payload: bytes::Bytes) -> Self {
        Self { source, payload }
    }
}
