// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mesh Node
//!
//! Owns one instance of every component and routes traffic between them:
//! transport events feed the handshake coordinators and, once a session is
//! ready, the encryption layer, relay engine and offline queue.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pakconnect_core::{InMemoryRadio, LocalIdentity, MeshNodeBuilder};
//!
//! let radio = InMemoryRadio::new(185);
//! let (endpoint, events) = radio.attach("aa:bb");
//! let identity = Arc::new(LocalIdentity::create("Alice")?);
//! let node = Arc::new(MeshNodeBuilder::new(identity, Arc::new(endpoint)).build()?);
//! tokio::spawn(node.clone().run(events));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::now_millis;
use crate::config::NodeConfig;
use crate::encryption::{
    EncryptionError, EncryptionLayer, PairingKeys, PairingSession, SealedContent,
};
use crate::error::{MeshError, MeshResult};
use crate::events::{event_channel, Publisher, Subscribers, Subscription};
use crate::handshake::{
    ConnectionPhase, HandshakeCoordinator, HandshakeError, PeerChannel, PhaseEvent,
};
use crate::identity::{ContactDirectory, InMemoryDirectory, LocalIdentity, PeerIdentity};
use crate::queue::{
    MessagePriority, OfflineMessageQueue, QueueEvent, QueueStatistics, QueueStore, QueuedMessage,
    RetryFired,
};
use crate::relay::{
    AckOutcome, DropReason, MeshRelayEngine, NextHopCandidate, NextHopStrategy, RelayDecision,
    RelayEvent, RelayMessage, RelayMetadata, RelayStatistics,
};
use crate::store::{DeliveredMessage, Direction, InMemoryMessageStore, MessageStore};
use crate::transport::{
    Addressing, DeliveryAck, MessageTransport, Payload, ProtocolMessage, RelayAck, Transport,
    TransportError, TransportEvent,
};

/// Application messages held per link while its handshake runs.
const MAX_BUFFERED_PER_LINK: usize = 64;

/// Inbound message ids remembered for duplicate suppression.
const RECENT_INBOUND_CAPACITY: usize = 4096;

/// Plaintext carried inside sealed content.
#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload {
    chat_id: String,
    body: Vec<u8>,
}

/// Handshake output path for one link.
struct LinkChannel {
    transport: Arc<MessageTransport>,
    link_id: String,
}

impl PeerChannel for LinkChannel {
    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError> {
        self.transport.send(&self.link_id, &message).map(|_| ())
    }
}

struct LinkSession {
    coordinator: Arc<HandshakeCoordinator>,
    /// Set once the handshake completed.
    peer: Option<PeerIdentity>,
    discovered_at: u64,
    buffered: Vec<ProtocolMessage>,
}

/// A pairing exchange in progress with one session peer.
struct PendingPairing {
    session: PairingSession,
    /// Peer disclosure that arrived before the local user entered the code.
    received: Option<PairingKeys>,
}

/// Bounded FIFO set of message ids.
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        RecentIds {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Builder for [`MeshNode`].
pub struct MeshNodeBuilder {
    identity: Arc<LocalIdentity>,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    directory: Option<Arc<dyn ContactDirectory>>,
    message_store: Option<Arc<dyn MessageStore>>,
    queue_store: Option<QueueStore>,
    strategy: Option<Box<dyn NextHopStrategy>>,
}

impl MeshNodeBuilder {
    /// Creates a builder with default configuration and in-memory seams.
    pub fn new(identity: Arc<LocalIdentity>, transport: Arc<dyn Transport>) -> Self {
        MeshNodeBuilder {
            identity,
            transport,
            config: NodeConfig::default(),
            directory: None,
            message_store: None,
            queue_store: None,
            strategy: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the contact directory.
    pub fn directory(mut self, directory: Arc<dyn ContactDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Sets the chat history store.
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Sets the durable queue store. Defaults to an in-memory database.
    pub fn queue_store(mut self, store: QueueStore) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Sets the next-hop selection strategy.
    pub fn strategy(mut self, strategy: Box<dyn NextHopStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Builds the node, recovering any interrupted queue attempts.
    pub fn build(self) -> MeshResult<MeshNode> {
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let message_store = self
            .message_store
            .unwrap_or_else(|| Arc::new(InMemoryMessageStore::new()));
        let queue_store = match self.queue_store {
            Some(store) => store,
            None => QueueStore::in_memory()?,
        };

        let (phase_publisher, phase_subscribers) = event_channel();
        let (relay_publisher, relay_subscribers) = event_channel();
        let (queue_publisher, queue_subscribers) = event_channel();

        let transport = Arc::new(MessageTransport::new(
            self.transport,
            self.config.transport.clone(),
        ));
        let encryption = EncryptionLayer::new(
            Arc::clone(&self.identity),
            Arc::clone(&directory),
            &self.config.encryption,
        );

        let mut relay = MeshRelayEngine::new(
            &self.identity.ephemeral_id(),
            self.config.relay.clone(),
            relay_publisher,
        )
        .with_alias(&self.identity.persistent_id());
        if let Some(strategy) = self.strategy {
            relay = relay.with_strategy(strategy);
        }

        let queue = OfflineMessageQueue::new(
            queue_store,
            self.config.queue.clone(),
            Arc::clone(&directory),
            Arc::clone(&message_store),
            queue_publisher,
            now_millis(),
        )?;

        info!(
            node = %self.identity.ephemeral_id(),
            name = %self.identity.display_name(),
            strategy = relay.strategy_name(),
            "Mesh node built"
        );

        Ok(MeshNode {
            identity: self.identity,
            config: self.config,
            directory,
            message_store,
            transport,
            encryption,
            relay,
            queue,
            links: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            received: Mutex::new(RecentIds::new(RECENT_INBOUND_CAPACITY)),
            pairings: Mutex::new(HashMap::new()),
            phase_publisher,
            phase_subscribers,
            relay_subscribers,
            queue_subscribers,
        })
    }
}

/// A mesh participant.
///
/// All methods take `&self`; share the node behind an [`Arc`] between the
/// [`run`](Self::run) loop and application calls.
pub struct MeshNode {
    identity: Arc<LocalIdentity>,
    config: NodeConfig,
    directory: Arc<dyn ContactDirectory>,
    message_store: Arc<dyn MessageStore>,
    transport: Arc<MessageTransport>,
    encryption: EncryptionLayer,
    relay: MeshRelayEngine,
    queue: OfflineMessageQueue,
    links: Mutex<HashMap<String, LinkSession>>,
    /// Direct sends awaiting a delivery ACK: message id to link id.
    in_flight: Mutex<HashMap<String, String>>,
    received: Mutex<RecentIds>,
    /// Pairing exchanges keyed by the peer's ephemeral id.
    pairings: Mutex<HashMap<String, PendingPairing>>,
    phase_publisher: Publisher<PhaseEvent>,
    phase_subscribers: Subscribers<PhaseEvent>,
    relay_subscribers: Subscribers<RelayEvent>,
    queue_subscribers: Subscribers<QueueEvent>,
}

impl MeshNode {
    fn links(&self) -> MutexGuard<'_, HashMap<String, LinkSession>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn received(&self) -> MutexGuard<'_, RecentIds> {
        self.received.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pairings(&self) -> MutexGuard<'_, HashMap<String, PendingPairing>> {
        self.pairings.lock().unwrap_or_else(|e| e.into_inner())
    }

    // === Accessors ===

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// Routing id of this node (its ephemeral id).
    pub fn node_id(&self) -> &str {
        self.relay.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn ContactDirectory> {
        &self.directory
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.message_store
    }

    pub fn encryption(&self) -> &EncryptionLayer {
        &self.encryption
    }

    pub fn relay(&self) -> &MeshRelayEngine {
        &self.relay
    }

    pub fn queue(&self) -> &OfflineMessageQueue {
        &self.queue
    }

    pub fn transport(&self) -> &MessageTransport {
        &self.transport
    }

    pub fn subscribe_phases(&self) -> Subscription<PhaseEvent> {
        self.phase_subscribers.subscribe()
    }

    pub fn subscribe_relay(&self) -> Subscription<RelayEvent> {
        self.relay_subscribers.subscribe()
    }

    pub fn subscribe_queue(&self) -> Subscription<QueueEvent> {
        self.queue_subscribers.subscribe()
    }

    pub fn relay_statistics(&self) -> RelayStatistics {
        self.relay.statistics()
    }

    pub fn queue_statistics(&self) -> MeshResult<QueueStatistics> {
        Ok(self.queue.statistics()?)
    }

    /// Peers with a completed session, keyed by link id.
    pub fn connected_peers(&self) -> Vec<(String, PeerIdentity)> {
        self.links()
            .iter()
            .filter_map(|(link_id, session)| {
                session
                    .peer
                    .as_ref()
                    .map(|peer| (link_id.clone(), self.current(peer)))
            })
            .collect()
    }

    /// Returns true once the handshake on `link_id` completed.
    pub fn is_session_ready(&self, link_id: &str) -> bool {
        self.links()
            .get(link_id)
            .is_some_and(|session| session.peer.is_some())
    }

    // === Pairing ===

    /// Starts pairing with a peer this node has a session with. Returns the
    /// code to show the user; a previous exchange with the peer is dropped.
    pub fn start_pairing(&self, peer_id: &str) -> MeshResult<String> {
        let (_, peer) = self.session_with(peer_id)?;
        let session = PairingSession::new(&self.identity.ephemeral_id(), &peer.ephemeral_id);
        let code = session.local_code().to_string();
        self.pairings().insert(
            peer.ephemeral_id.clone(),
            PendingPairing {
                session,
                received: None,
            },
        );
        info!(peer = %peer.ephemeral_id, "Pairing started");
        Ok(code)
    }

    /// Enters the code shown on the peer's screen and discloses this node's
    /// keys to the peer. Completes at once if the peer's disclosure is
    /// already here.
    pub fn submit_pairing_code(
        &self,
        peer_id: &str,
        peer_code: &str,
        now: u64,
    ) -> MeshResult<()> {
        let (link_id, peer) = self.session_with(peer_id)?;
        let (ours, theirs) = {
            let mut pairings = self.pairings();
            let pending = pairings
                .get_mut(&peer.ephemeral_id)
                .ok_or_else(|| no_pairing(&peer.ephemeral_id))?;
            pending.session.enter_peer_code(peer_code)?;
            (
                pending.session.disclose(&self.identity)?,
                pending.received.take(),
            )
        };

        match theirs {
            Some(theirs) => {
                self.finish_pairing(&peer.ephemeral_id, &theirs)?;
                self.send_on(&link_id, Payload::PairingConfirm(ours), now)
            }
            None => self.send_on(&link_id, Payload::PairingRequest(ours), now),
        }
    }

    /// Returns true while a pairing exchange with `peer_id` is open.
    pub fn is_pairing(&self, peer_id: &str) -> bool {
        self.directory
            .lookup(peer_id)
            .is_some_and(|peer| self.pairings().contains_key(&peer.ephemeral_id))
    }

    fn on_pairing_keys(
        &self,
        link_id: &str,
        peer: &PeerIdentity,
        keys: PairingKeys,
        is_request: bool,
        now: u64,
    ) -> MeshResult<()> {
        let reply = {
            let mut pairings = self.pairings();
            let Some(pending) = pairings.get_mut(&peer.ephemeral_id) else {
                debug!(peer = %peer.ephemeral_id, "Pairing keys without an open exchange");
                return Ok(());
            };
            if !pending.session.has_peer_code() {
                pending.received = Some(keys);
                return Ok(());
            }
            // Our request already went out; a request crossing it gets a confirm.
            if is_request {
                Some(pending.session.disclose(&self.identity)?)
            } else {
                None
            }
        };

        self.finish_pairing(&peer.ephemeral_id, &keys)?;
        match reply {
            Some(ours) => self.send_on(link_id, Payload::PairingConfirm(ours), now),
            None => Ok(()),
        }
    }

    /// Closes the exchange with `peer_ephemeral_id`, pairing on success.
    fn finish_pairing(&self, peer_ephemeral_id: &str, keys: &PairingKeys) -> MeshResult<()> {
        let pending = self
            .pairings()
            .remove(peer_ephemeral_id)
            .ok_or_else(|| no_pairing(peer_ephemeral_id))?;
        if let Err(e) = pending.session.complete(self.directory.as_ref(), keys) {
            warn!(peer = %peer_ephemeral_id, error = %e, "Pairing failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Link and directory record of a peer with a completed session.
    fn session_with(&self, peer_id: &str) -> MeshResult<(String, PeerIdentity)> {
        let peer = self
            .directory
            .lookup(peer_id)
            .ok_or_else(|| MeshError::SessionNotReady(peer_id.to_string()))?;
        let link_id = self
            .link_to(&peer.ephemeral_id)
            .ok_or_else(|| MeshError::SessionNotReady(peer_id.to_string()))?;
        Ok((link_id, peer))
    }

    /// Latest directory view of a session peer (pairing may have moved on).
    fn current(&self, peer: &PeerIdentity) -> PeerIdentity {
        self.directory
            .lookup(&peer.ephemeral_id)
            .unwrap_or_else(|| peer.clone())
    }

    // === Links ===

    /// Connects to `link_id` and runs the handshake.
    pub async fn connect_peer(&self, link_id: &str) -> MeshResult<PeerIdentity> {
        let mtu = self.transport.transport().connect(link_id)?;
        let coordinator = self.open_session(link_id, mtu, now_millis());
        self.complete_handshake(link_id, coordinator).await
    }

    /// Runs the handshake on a link the peer opened.
    pub async fn accept_peer(&self, link_id: &str, mtu: usize) -> MeshResult<PeerIdentity> {
        let coordinator = self.open_session(link_id, mtu, now_millis());
        self.complete_handshake(link_id, coordinator).await
    }

    /// Registers the link and its coordinator. Runs before the handshake
    /// task starts so the peer's first phase message finds the session.
    fn open_session(&self, link_id: &str, mtu: usize, now: u64) -> Arc<HandshakeCoordinator> {
        self.transport.register_link(link_id, mtu);
        let channel = Arc::new(LinkChannel {
            transport: Arc::clone(&self.transport),
            link_id: link_id.to_string(),
        });
        let coordinator = Arc::new(HandshakeCoordinator::new(
            link_id,
            Arc::clone(&self.identity),
            Arc::clone(&self.directory),
            channel,
            self.config.handshake.clone(),
            mtu,
            self.phase_publisher.clone(),
        ));

        let previous = self.links().insert(
            link_id.to_string(),
            LinkSession {
                coordinator: Arc::clone(&coordinator),
                peer: None,
                discovered_at: now,
                buffered: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            debug!(link = %link_id, "Replacing existing session");
            previous.coordinator.cancel();
        }
        coordinator
    }

    async fn complete_handshake(
        &self,
        link_id: &str,
        coordinator: Arc<HandshakeCoordinator>,
    ) -> MeshResult<PeerIdentity> {
        let peer = match coordinator.start_handshake().await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(link = %link_id, error = %e, "Handshake failed, closing link");
                let removed = {
                    let mut links = self.links();
                    let ours = links
                        .get(link_id)
                        .is_some_and(|s| Arc::ptr_eq(&s.coordinator, &coordinator));
                    if ours {
                        links.remove(link_id)
                    } else {
                        None
                    }
                };
                if removed.is_some() {
                    self.transport.cancel_link(link_id);
                    if let Err(e) = self.transport.transport().disconnect(link_id) {
                        debug!(link = %link_id, error = %e, "Disconnect after failed handshake");
                    }
                }
                return Err(e.into());
            }
        };

        if let Some(mtu) = coordinator.negotiated_mtu() {
            self.transport.register_link(link_id, mtu);
        }

        let buffered = {
            let mut links = self.links();
            match links.get_mut(link_id) {
                Some(session) if Arc::ptr_eq(&session.coordinator, &coordinator) => {
                    session.peer = Some(peer.clone());
                    std::mem::take(&mut session.buffered)
                }
                _ => return Err(HandshakeError::Cancelled.into()),
            }
        };
        info!(
            link = %link_id,
            peer = %peer.ephemeral_id,
            buffered = buffered.len(),
            "Session ready"
        );

        let now = now_millis();
        for message in buffered {
            if let Err(e) = self.handle_inbound(link_id, message, now) {
                warn!(link = %link_id, error = %e, "Buffered message rejected");
            }
        }
        if let Err(e) = self.dispatch_pending(now) {
            warn!(error = %e, "Dispatch after session ready failed");
        }
        Ok(peer)
    }

    /// Tears down a link. In-flight direct attempts on it count as failed;
    /// queued messages stay queued.
    pub fn on_disconnected(&self, link_id: &str, now: u64) {
        let removed = self.links().remove(link_id);
        if let Some(session) = removed {
            session.coordinator.cancel();
        }
        let dropped = self.transport.cancel_link(link_id);

        let stranded: Vec<String> = {
            let mut in_flight = self.in_flight();
            let ids: Vec<String> = in_flight
                .iter()
                .filter(|(_, link)| link.as_str() == link_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                in_flight.remove(id);
            }
            ids
        };
        for id in &stranded {
            if let Err(e) = self.queue.mark_failed_attempt(id, "link lost", now) {
                warn!(message_id = %id, error = %e, "Could not record lost attempt");
            }
        }
        info!(
            link = %link_id,
            partials = dropped,
            stranded = stranded.len(),
            "Link disconnected"
        );
    }

    // === Inbound ===

    /// Feeds one transport event. Inbound connections start a handshake
    /// task on the current runtime.
    pub fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let now = now_millis();
        match event {
            TransportEvent::Connected { link_id, mtu } => {
                let coordinator = self.open_session(&link_id, mtu, now);
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = node.complete_handshake(&link_id, coordinator).await;
                });
            }
            TransportEvent::Data { link_id, bytes } => {
                if let Err(e) = self.handle_data(&link_id, &bytes, now) {
                    debug!(link = %link_id, error = %e, "Inbound data rejected");
                }
            }
            TransportEvent::Disconnected { link_id } => self.on_disconnected(&link_id, now),
        }
    }

    /// Feeds one raw chunk from `link_id`.
    pub fn handle_data(&self, link_id: &str, bytes: &[u8], now: u64) -> MeshResult<()> {
        match self.transport.receive(link_id, bytes, now)? {
            Some(message) => self.handle_inbound(link_id, message, now),
            None => Ok(()),
        }
    }

    /// Routes one reassembled message.
    pub fn handle_inbound(&self, link_id: &str, message: ProtocolMessage, now: u64) -> MeshResult<()> {
        let (coordinator, peer) = {
            let mut links = self.links();
            let session = links
                .get_mut(link_id)
                .ok_or_else(|| MeshError::UnknownLink(link_id.to_string()))?;

            if message.message_type().is_handshake() {
                (Arc::clone(&session.coordinator), None)
            } else if let Some(peer) = &session.peer {
                (Arc::clone(&session.coordinator), Some(peer.clone()))
            } else if matches!(
                session.coordinator.phase(),
                ConnectionPhase::Timeout | ConnectionPhase::Failed
            ) {
                return Err(HandshakeError::NotComplete.into());
            } else if session.buffered.len() >= MAX_BUFFERED_PER_LINK {
                warn!(link = %link_id, "Pre-session buffer full, dropping message");
                return Err(MeshError::SessionNotReady(link_id.to_string()));
            } else {
                session.buffered.push(message);
                return Ok(());
            }
        };

        let Some(peer) = peer else {
            return Ok(coordinator.handle_message(&message)?);
        };
        let peer = self.current(&peer);

        let ProtocolMessage {
            payload, addressing, ..
        } = message;
        match payload {
            Payload::Direct(content) => self.on_direct(link_id, &peer, addressing, content, now),
            Payload::DeliveryAck(ack) => self.on_delivery_ack(link_id, &ack.message_id, now),
            Payload::Relay(relay) => self.on_relay(link_id, &peer, relay, now),
            Payload::RelayAck(ack) => self.on_relay_ack(&peer, ack, now),
            Payload::PairingRequest(keys) => {
                self.on_pairing_keys(link_id, &peer, keys, true, now)
            }
            Payload::PairingConfirm(keys) => {
                self.on_pairing_keys(link_id, &peer, keys, false, now)
            }
            other => {
                debug!(link = %link_id, message_type = ?other.message_type(), "Ignoring message");
                Ok(())
            }
        }
    }

    fn on_direct(
        &self,
        link_id: &str,
        peer: &PeerIdentity,
        addressing: Option<Addressing>,
        content: SealedContent,
        now: u64,
    ) -> MeshResult<()> {
        let addressing = addressing
            .ok_or_else(|| MeshError::MalformedMessage("direct message without addressing".into()))?;
        if !peer.matches_id(&addressing.sender_id) {
            warn!(link = %link_id, sender = %addressing.sender_id, "Sender is not the link peer");
            return Err(MeshError::MalformedMessage(format!(
                "sender {} is not the peer on {}",
                addressing.sender_id, link_id
            )));
        }
        if !self.identity.is_local_id(&addressing.recipient_id) {
            return Err(MeshError::MalformedMessage(format!(
                "direct message for {}",
                addressing.recipient_id
            )));
        }

        self.deliver_inbound(&addressing.sender_id, &addressing.recipient_id, &content)?;
        self.send_on(
            link_id,
            Payload::DeliveryAck(DeliveryAck {
                message_id: content.message_id,
            }),
            now,
        )
    }

    /// Verifies, decrypts and stores one inbound message. Repeats of an id
    /// already stored succeed without a second store write.
    fn deliver_inbound(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &SealedContent,
    ) -> MeshResult<()> {
        let plaintext = self.encryption.open(sender_id, recipient_id, content)?;
        if self.received().contains(&content.message_id) {
            debug!(message_id = %content.message_id, "Duplicate inbound message");
            return Ok(());
        }
        let chat: ChatPayload = bincode::deserialize(&plaintext)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;

        self.message_store.deliver(DeliveredMessage {
            message_id: content.message_id.clone(),
            chat_id: chat.chat_id,
            peer_id: sender_id.to_string(),
            content: chat.body,
            timestamp: content.timestamp,
            direction: Direction::Inbound,
        })?;
        self.received().insert(&content.message_id);
        info!(message_id = %content.message_id, sender = %sender_id, "Message received");
        Ok(())
    }

    fn on_delivery_ack(&self, link_id: &str, message_id: &str, now: u64) -> MeshResult<()> {
        {
            let mut in_flight = self.in_flight();
            if let Some(expected) = in_flight.get(message_id) {
                if expected != link_id {
                    warn!(message_id = %message_id, link = %link_id, "ACK from unexpected link");
                    return Ok(());
                }
            }
            in_flight.remove(message_id);
        }
        self.queue.mark_delivered(message_id, now)?;
        Ok(())
    }

    fn on_relay(
        &self,
        link_id: &str,
        peer: &PeerIdentity,
        relay: RelayMessage,
        now: u64,
    ) -> MeshResult<()> {
        let message_id = relay.metadata.original_message_id.clone();
        let final_recipient = relay.metadata.final_recipient.clone();
        let original_sender = relay.metadata.original_sender.clone();
        let content = relay.content.clone();

        let candidates = self.candidates();
        let decision =
            self.relay
                .process_incoming_relay(relay, &peer.ephemeral_id, &candidates, now);

        match decision {
            RelayDecision::DeliveredToSelf => {
                if let Err(e) = self.deliver_inbound(&original_sender, &final_recipient, &content) {
                    // Unacknowledged, so the originator retries.
                    self.relay.forget(&message_id);
                    return Err(e);
                }
                self.send_relay_ack(link_id, &message_id, &final_recipient, now)
            }
            RelayDecision::Dropped(DropReason::Duplicate) => {
                if self.relay.is_local(&final_recipient) || self.relay.was_acknowledged(&message_id)
                {
                    self.send_relay_ack(link_id, &message_id, &final_recipient, now)?;
                }
                Ok(())
            }
            RelayDecision::Relayed { .. } => {
                self.pump_relay(now);
                Ok(())
            }
            other => {
                debug!(message_id = %message_id, decision = ?other, "Relay not forwarded");
                Ok(())
            }
        }
    }

    fn send_relay_ack(
        &self,
        link_id: &str,
        message_id: &str,
        final_recipient: &str,
        now: u64,
    ) -> MeshResult<()> {
        self.send_on(
            link_id,
            Payload::RelayAck(RelayAck {
                original_message_id: message_id.to_string(),
                final_recipient: final_recipient.to_string(),
            }),
            now,
        )
    }

    fn on_relay_ack(&self, peer: &PeerIdentity, ack: RelayAck, now: u64) -> MeshResult<()> {
        match self
            .relay
            .on_relay_ack(&ack.original_message_id, &peer.ephemeral_id)
        {
            AckOutcome::Originator(message_id) => {
                self.queue.mark_delivered(&message_id, now)?;
            }
            AckOutcome::Forward { previous_hop } => match self.link_to(&previous_hop) {
                Some(link_id) => self.send_on(&link_id, Payload::RelayAck(ack), now)?,
                None => warn!(
                    message_id = %ack.original_message_id,
                    previous_hop = %previous_hop,
                    "Previous hop gone, relay ACK dropped"
                ),
            },
            AckOutcome::Unknown => {}
        }
        Ok(())
    }

    fn send_on(&self, link_id: &str, payload: Payload, now: u64) -> MeshResult<()> {
        self.transport
            .send(link_id, &ProtocolMessage::new(payload, now))?;
        Ok(())
    }

    // === Outbound ===

    /// Queues a chat message for `recipient_id` and tries to send it now.
    /// Returns the message id.
    pub fn send_message(
        &self,
        chat_id: &str,
        recipient_id: &str,
        body: &[u8],
        priority: MessagePriority,
        now: u64,
    ) -> MeshResult<String> {
        let message_id = self
            .queue
            .enqueue(chat_id, recipient_id, body, priority, now)?;
        if let Err(e) = self.dispatch_pending(now) {
            warn!(message_id = %message_id, error = %e, "Immediate dispatch failed");
        }
        Ok(message_id)
    }

    /// Attempts every due queued message that has somewhere to go.
    /// Returns the number of attempts started.
    pub fn dispatch_pending(&self, now: u64) -> MeshResult<usize> {
        self.queue.expire(now)?;
        for id in self.queue.reap_unacked(now)? {
            self.in_flight().remove(&id);
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut attempted = 0;
        for message in self.queue.dispatchable_within(now, |_| true)? {
            let Some(message) = self.queue.begin_attempt(&message.id, now)? else {
                continue;
            };
            attempted += 1;
            if let Err(e) = self.attempt(&message, &candidates, now) {
                warn!(message_id = %message.id, error = %e, "Send attempt failed");
                self.queue
                    .mark_failed_attempt(&message.id, &e.to_string(), now)?;
            }
        }
        self.pump_relay(now);
        Ok(attempted)
    }

    /// Sends direct when the recipient has a session, relays otherwise.
    fn attempt(
        &self,
        message: &QueuedMessage,
        candidates: &[NextHopCandidate],
        now: u64,
    ) -> MeshResult<()> {
        let plaintext = bincode::serialize(&ChatPayload {
            chat_id: message.chat_id.clone(),
            body: message.payload.clone(),
        })
        .map_err(|e| MeshError::Serialization(e.to_string()))?;
        let sealed = self
            .encryption
            .seal(&message.recipient_id, &message.id, now, &plaintext)?;

        if let Some(link_id) = self.link_to(&message.recipient_id) {
            let envelope = ProtocolMessage::new(Payload::Direct(sealed.content), now)
                .with_addressing(Addressing {
                    sender_id: sealed.sender_id,
                    recipient_id: message.recipient_id.clone(),
                });
            self.in_flight()
                .insert(message.id.clone(), link_id.clone());
            if let Err(e) = self.transport.send(&link_id, &envelope) {
                self.in_flight().remove(&message.id);
                return Err(e.into());
            }
            debug!(message_id = %message.id, link = %link_id, "Direct send");
            return Ok(());
        }

        let metadata = RelayMetadata::originate(
            &message.id,
            &sealed.sender_id,
            &message.recipient_id,
            message.priority,
            self.relay.node_id(),
        );
        let relay = RelayMessage {
            metadata,
            content: sealed.content,
        };
        match self.relay.originate(relay, candidates, now) {
            RelayDecision::Relayed { next_hop } => {
                debug!(message_id = %message.id, next_hop = %next_hop, "Relay originated");
                Ok(())
            }
            _ => Err(MeshError::NoRoute(message.recipient_id.clone())),
        }
    }

    /// Transmits relays the engine has ready. Returns the number sent.
    pub fn pump_relay(&self, now: u64) -> usize {
        let mut sent = 0;
        for outbound in self.relay.next_batch(now) {
            let message_id = outbound.message.metadata.original_message_id.clone();
            let Some(link_id) = self.link_to(&outbound.next_hop_id) else {
                self.relay.record_send_failure(&message_id);
                continue;
            };
            let envelope = ProtocolMessage::new(Payload::Relay(outbound.message), now);
            match self.transport.send(&link_id, &envelope) {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(message_id = %message_id, link = %link_id, error = %e, "Relay write failed");
                    self.relay.record_send_failure(&message_id);
                }
            }
        }
        sent
    }

    /// Periodic housekeeping: stale partials, relay state, due messages.
    pub fn maintain(&self, now: u64) {
        let pruned = self.transport.prune(now);
        let cleaned = self.relay.cleanup(now);
        if pruned + cleaned > 0 {
            debug!(pruned, cleaned, "Maintenance pass");
        }
        if let Err(e) = self.dispatch_pending(now) {
            warn!(error = %e, "Dispatch failed");
        }
    }

    /// Drives the node: transport events, retry timers and periodic
    /// maintenance. Returns once the transport feed closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut retries = self.queue.take_retry_receiver();
        let mut tick = tokio::time::interval(self.config.relay.drain_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => break,
                },
                Some(fired) = next_retry(&mut retries) => self.on_retry(&fired),
                _ = tick.tick() => self.maintain(now_millis()),
            }
        }
        info!(node = %self.node_id(), "Transport feed closed, node stopped");
    }

    fn on_retry(&self, fired: &RetryFired) {
        let now = now_millis();
        match self.queue.on_retry_fired(fired, now) {
            Ok(Some(_)) => {
                if let Err(e) = self.dispatch_pending(now) {
                    warn!(error = %e, "Dispatch after retry failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(message_id = %fired.message_id, error = %e, "Retry timer failed"),
        }
    }

    // === Routing helpers ===

    /// Neighbours with a completed session.
    fn candidates(&self) -> Vec<NextHopCandidate> {
        let links = self.links();
        links
            .iter()
            .filter_map(|(link_id, session)| {
                let peer = self.current(session.peer.as_ref()?);
                let mut candidate = NextHopCandidate::new(&peer.ephemeral_id, session.discovered_at)
                    .with_addressing_id(&peer.addressing_id());
                if let Some(quality) = self.transport.transport().link_quality(link_id) {
                    candidate = candidate.with_link_quality(quality);
                }
                Some(candidate)
            })
            .collect()
    }

    /// Link whose completed session peer answers to `id`.
    fn link_to(&self, id: &str) -> Option<String> {
        self.links().iter().find_map(|(link_id, session)| {
            let peer = session.peer.as_ref()?;
            (peer.matches_id(id) || self.current(peer).matches_id(id)).then(|| link_id.clone())
        })
    }
}

fn no_pairing(peer_id: &str) -> MeshError {
    EncryptionError::Pairing(format!("no pairing in progress with {}", peer_id)).into()
}

async fn next_retry(rx: &mut Option<mpsc::UnboundedReceiver<RetryFired>>) -> Option<RetryFired> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
