// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! PakConnect Core Library
//!
//! Offline, peer-to-peer messaging over short-range radio links. Nodes
//! handshake on every link, encrypt at the strongest tier the pair shares,
//! relay for each other across multiple hops, and keep unsent messages in
//! a durable, retry-scheduled queue.
//! All signing and key agreement use the audited `ring` and `x25519-dalek`
//! crates.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod encryption;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod node;
pub mod queue;
pub mod relay;
pub mod store;
pub mod transport;

pub use config::{
    EncryptionConfig, HandshakeConfig, NodeConfig, QueueConfig, RelayConfig, TransportConfig,
};
pub use crypto::{PublicKey, Signature, SigningKeyPair, SymmetricKey};
pub use encryption::{
    EncryptionError, EncryptionLayer, EncryptionTier, PairingKeys, PairingSession, SealedContent,
};
pub use error::{MeshError, MeshResult};
pub use events::{event_channel, Publisher, Subscribers, Subscription};
pub use handshake::{
    ConnectionPhase, HandshakeCoordinator, HandshakeError, PeerChannel, PhaseEvent,
};
pub use identity::{
    ContactDirectory, IdentityError, InMemoryDirectory, LocalIdentity, PairingState, PeerIdentity,
};
pub use node::{MeshNode, MeshNodeBuilder};
pub use queue::{
    MessagePriority, OfflineMessageQueue, QueueError, QueueEvent, QueueStatistics, QueueStatus,
    QueueStore, QueuedMessage,
};
pub use relay::{
    DiscoveryOrder, MeshRelayEngine, NextHopCandidate, NextHopStrategy, RelayDecision,
    RelayEvent, RelayMessage, RelayMetadata, RelayStatistics, StrongestLink,
};
pub use store::{DeliveredMessage, Direction, InMemoryMessageStore, MessageStore, StoreError};
pub use transport::{
    Codec, ConnectionState, InMemoryRadio, MessageTransport, ProtocolMessage, RadioEndpoint,
    Transport, TransportError, TransportEvent,
};
