// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport Module
//!
//! The radio link is consumed through the [`Transport`] trait. Above it,
//! [`MessageTransport`] fragments encoded envelopes to the link MTU,
//! serializes writes per link, and reassembles inbound chunks before the
//! codec ever sees them.

pub mod codec;
pub mod fragment;
mod link;
mod radio;

pub use codec::{
    Addressing, Codec, CodecError, ConnectionReady, ConnectionReadyAck, ContactStatus,
    DeliveryAck, HandshakeReject, Identity, IdentityAck, MessageType, Payload, ProtocolMessage,
    RelayAck, FLAG_ADDRESSING, FLAG_COMPRESSED, FLAG_MARKER, FLAG_SIGNATURE,
};
pub use fragment::{fragment, MessageChunk, Reassembler, CHUNK_HEADER_SIZE};
pub use link::MessageTransport;
pub use radio::{InMemoryRadio, RadioEndpoint};

use thiserror::Error;

/// Transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Peer {0} is out of range")]
    Unreachable(String),

    #[error("Write to {peer} failed: {reason}")]
    WriteFailed { peer: String, reason: String },

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Unit size {0} leaves no room for chunk data")]
    UnitTooSmall(usize),

    #[error("Payload needs {0} chunks, more than a chunk header can count")]
    PayloadTooLarge(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Link state for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound feed produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connected to us.
    Connected { link_id: String, mtu: usize },
    /// Raw bytes (one chunk) from a peer.
    Data { link_id: String, bytes: Vec<u8> },
    /// The link to a peer went away.
    Disconnected { link_id: String },
}

/// Physical link abstraction (BLE central/peripheral in production).
///
/// Links are named by an opaque `link_id` (a device address); mesh identity
/// is established later by the handshake. Methods take `&self` so one
/// transport can be shared by the dispatch loop and handshake tasks.
pub trait Transport: Send + Sync {
    /// Connects to a peer and returns the negotiated MTU.
    fn connect(&self, link_id: &str) -> TransportResult<usize>;

    /// Disconnects from a peer. Safe to call when not connected.
    fn disconnect(&self, link_id: &str) -> TransportResult<()>;

    /// Current link state.
    fn state(&self, link_id: &str) -> ConnectionState;

    /// Writes one chunk. Returns once the link acknowledged the write.
    fn write(&self, link_id: &str, bytes: &[u8]) -> TransportResult<()>;

    /// Negotiated MTU for a connected peer.
    fn mtu(&self, link_id: &str) -> Option<usize>;

    /// Link quality (RSSI-like, higher is better) if the radio reports one.
    fn link_quality(&self, _link_id: &str) -> Option<i16> {
        None
    }
}
