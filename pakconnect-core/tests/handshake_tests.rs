// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Handshake phase sequencing between two coordinators.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use pakconnect_core::transport::{
    ConnectionReady, ConnectionReadyAck, DeliveryAck, MessageType, Payload,
};
use pakconnect_core::{
    event_channel, ConnectionPhase, ContactDirectory, HandshakeConfig, HandshakeCoordinator,
    HandshakeError, InMemoryDirectory, PairingState, PeerChannel, PeerIdentity, PhaseEvent,
    ProtocolMessage, Subscription, TransportError,
};

/// Records every message and forwards it to the other side's pump.
struct Wire {
    tx: mpsc::UnboundedSender<ProtocolMessage>,
    sent: Mutex<Vec<MessageType>>,
}

impl Wire {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Wire {
                tx,
                sent: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    fn sent(&self) -> Vec<MessageType> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerChannel for Wire {
    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(message.message_type());
        self.tx
            .send(message)
            .map_err(|_| TransportError::NotConnected("peer".into()))
    }
}

struct Side {
    coordinator: Arc<HandshakeCoordinator>,
    wire: Arc<Wire>,
    directory: Arc<InMemoryDirectory>,
    phases: Subscription<PhaseEvent>,
}

fn side(
    name: &str,
    seed: u8,
    config: HandshakeConfig,
    mtu: usize,
) -> (Side, mpsc::UnboundedReceiver<ProtocolMessage>) {
    let (wire, rx) = Wire::new();
    let directory = Arc::new(InMemoryDirectory::new());
    let (publisher, subscribers) = event_channel();
    let phases = subscribers.subscribe();
    let coordinator = Arc::new(HandshakeCoordinator::new(
        &format!("link-{}", name),
        common::identity(name, seed),
        directory.clone(),
        wire.clone(),
        config,
        mtu,
        publisher,
    ));
    (
        Side {
            coordinator,
            wire,
            directory,
            phases,
        },
        rx,
    )
}

/// Feeds everything sent on one wire into `to`.
fn pump(mut rx: mpsc::UnboundedReceiver<ProtocolMessage>, to: Arc<HandshakeCoordinator>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let _ = to.handle_message(&message);
        }
    });
}

fn connected_pair(
    a_config: HandshakeConfig,
    b_config: HandshakeConfig,
) -> (Side, Side) {
    let (a, a_rx) = side("alice", 1, a_config, 185);
    let (b, b_rx) = side("bob", 2, b_config, 100);
    pump(a_rx, b.coordinator.clone());
    pump(b_rx, a.coordinator.clone());
    (a, b)
}

#[tokio::test]
async fn test_handshake_completes_and_resolves_peers() {
    common::init_tracing();
    let (a, b) = connected_pair(HandshakeConfig::default(), HandshakeConfig::default());

    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );
    let bob_seen_by_alice = a_result.unwrap();
    let alice_seen_by_bob = b_result.unwrap();

    assert_eq!(bob_seen_by_alice.display_name, "bob");
    assert_eq!(alice_seen_by_bob.display_name, "alice");
    assert_eq!(bob_seen_by_alice.pairing_state, PairingState::Unpaired);
    assert!(a.coordinator.is_complete());
    assert!(b.coordinator.is_complete());
    assert_eq!(a.coordinator.negotiated_mtu(), Some(100));
    assert_eq!(b.coordinator.negotiated_mtu(), Some(100));

    // The resolved peer lands in the directory.
    assert!(a
        .directory
        .lookup(&bob_seen_by_alice.ephemeral_id)
        .is_some());
}

#[tokio::test]
async fn test_phases_are_published_in_order() {
    let (mut a, b) = connected_pair(HandshakeConfig::default(), HandshakeConfig::default());
    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );
    a_result.unwrap();
    b_result.unwrap();

    let phases: Vec<ConnectionPhase> = a.phases.drain().into_iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![
            ConnectionPhase::ReadySent,
            ConnectionPhase::ReadyAckWaiting,
            ConnectionPhase::ReadyComplete,
            ConnectionPhase::IdentitySent,
            ConnectionPhase::IdentityAckWaiting,
            ConnectionPhase::IdentityComplete,
            ConnectionPhase::ContactStatusSent,
            ConnectionPhase::ContactStatusAckWaiting,
            ConnectionPhase::ContactStatusComplete,
            ConnectionPhase::SessionReady,
            ConnectionPhase::Complete,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_without_further_sends() {
    let config = HandshakeConfig::default().with_phase_timeout_ms(5_000);
    let (a, _silent_rx) = side("alice", 1, config, 185);

    let result = a.coordinator.start_handshake().await;
    assert_eq!(
        result.unwrap_err(),
        HandshakeError::Timeout {
            phase: ConnectionPhase::ReadyAckWaiting
        }
    );
    assert_eq!(a.coordinator.phase(), ConnectionPhase::Timeout);
    assert_eq!(a.wire.sent(), vec![MessageType::ConnectionReady]);

    // A late ready message is ignored and not acknowledged.
    let late = ProtocolMessage::new(
        Payload::ConnectionReady(ConnectionReady {
            protocol_version: 1,
            mtu: 185,
        }),
        0,
    );
    assert!(a.coordinator.handle_message(&late).is_ok());
    assert_eq!(a.wire.sent(), vec![MessageType::ConnectionReady]);
}

#[tokio::test(start_paused = true)]
async fn test_each_phase_has_its_own_timeout() {
    let config = HandshakeConfig::default().with_phase_timeout_ms(1_000);
    let (a, _rx) = side("alice", 1, config, 185);
    let coordinator = a.coordinator.clone();
    let task = tokio::spawn(async move { coordinator.start_handshake().await });

    // Peer answers the ready phase, then goes quiet.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let ready = ProtocolMessage::new(
        Payload::ConnectionReady(ConnectionReady {
            protocol_version: HandshakeConfig::default().protocol_version,
            mtu: 185,
        }),
        0,
    );
    a.coordinator.handle_message(&ready).unwrap();
    a.coordinator
        .handle_message(&ProtocolMessage::new(
            Payload::ConnectionReadyAck(ConnectionReadyAck {
                protocol_version: HandshakeConfig::default().protocol_version,
            }),
            0,
        ))
        .unwrap();

    let result = task.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        HandshakeError::Timeout {
            phase: ConnectionPhase::IdentityAckWaiting
        }
    );
}

#[tokio::test]
async fn test_protocol_version_mismatch_is_rejected() {
    let (a, b) = connected_pair(
        HandshakeConfig::default(),
        HandshakeConfig::default().with_protocol_version(99),
    );

    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );
    assert!(matches!(a_result, Err(HandshakeError::Rejected { .. })));
    assert!(matches!(b_result, Err(HandshakeError::Rejected { .. })));
    assert_eq!(a.coordinator.phase(), ConnectionPhase::Failed);
    assert!(a.wire.sent().contains(&MessageType::HandshakeReject));
}

#[tokio::test]
async fn test_application_messages_refused_before_completion() {
    let (a, _rx) = side("alice", 1, HandshakeConfig::default(), 185);
    let message = ProtocolMessage::new(
        Payload::DeliveryAck(DeliveryAck {
            message_id: "m1".into(),
        }),
        0,
    );
    assert_eq!(
        a.coordinator.handle_message(&message),
        Err(HandshakeError::NotComplete)
    );
}

#[tokio::test]
async fn test_cancel_ends_pending_wait() {
    let (a, _rx) = side("alice", 1, HandshakeConfig::default(), 185);
    let coordinator = a.coordinator.clone();
    let task = tokio::spawn(async move { coordinator.start_handshake().await });

    while a.coordinator.phase() != ConnectionPhase::ReadyAckWaiting {
        tokio::task::yield_now().await;
    }
    a.coordinator.cancel();
    assert_eq!(task.await.unwrap().unwrap_err(), HandshakeError::Cancelled);
    assert_eq!(a.coordinator.phase(), ConnectionPhase::Failed);
}

#[tokio::test]
async fn test_second_start_is_refused() {
    let (a, b) = connected_pair(HandshakeConfig::default(), HandshakeConfig::default());
    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );
    a_result.unwrap();
    b_result.unwrap();

    assert_eq!(
        a.coordinator.start_handshake().await.unwrap_err(),
        HandshakeError::AlreadyFinished(ConnectionPhase::Complete)
    );
}

#[tokio::test]
async fn test_known_paired_contact_reveals_persistent_key() {
    let (a, a_rx) = side("alice", 1, HandshakeConfig::default(), 185);
    let (b, b_rx) = side("bob", 2, HandshakeConfig::default(), 185);

    // Each side already paired with the other in an earlier session.
    let alice = common::identity("alice", 1);
    let bob = common::identity("bob", 2);
    let mut bob_record = PeerIdentity::unpaired(&bob.ephemeral_id(), "bob").unwrap();
    bob_record.upgrade_to_paired(bob.persistent_public_key(), Some(bob.exchange_public_key()));
    a.directory.upsert(bob_record);
    let mut alice_record = PeerIdentity::unpaired(&alice.ephemeral_id(), "alice").unwrap();
    alice_record.upgrade_to_paired(
        alice.persistent_public_key(),
        Some(alice.exchange_public_key()),
    );
    b.directory.upsert(alice_record);

    pump(a_rx, b.coordinator.clone());
    pump(b_rx, a.coordinator.clone());
    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );

    let bob_seen = a_result.unwrap();
    b_result.unwrap();
    assert!(bob_seen.is_paired());
    assert_eq!(bob_seen.persistent_public_key, Some(bob.persistent_public_key()));
    assert_eq!(bob_seen.addressing_id(), bob.persistent_id());
}

#[tokio::test]
async fn test_paired_contact_with_new_ephemeral_id_is_recognised() {
    common::init_tracing();
    let (a, a_rx) = side("alice", 1, HandshakeConfig::default(), 185);

    // Bob restarted: same master seed, fresh ephemeral key, and no record
    // of Alice on his side.
    let (b_wire, b_rx) = Wire::new();
    let b_directory = Arc::new(InMemoryDirectory::new());
    let (publisher, _subscribers) = event_channel();
    let bob_before = common::identity("bob", 2);
    let bob_after = Arc::new(
        pakconnect_core::LocalIdentity::from_seeds([2u8; 32], [77u8; 32], "bob").unwrap(),
    );
    let b = Arc::new(HandshakeCoordinator::new(
        "link-bob",
        bob_after.clone(),
        b_directory,
        b_wire,
        HandshakeConfig::default(),
        185,
        publisher,
    ));

    let mut bob_record = PeerIdentity::unpaired(&bob_before.ephemeral_id(), "bob").unwrap();
    bob_record.upgrade_to_paired(
        bob_before.persistent_public_key(),
        Some(bob_before.exchange_public_key()),
    );
    a.directory.upsert(bob_record);
    a.directory
        .store_pairing_secret(&bob_before.ephemeral_id(), [5u8; 32]);

    pump(a_rx, b.clone());
    pump(b_rx, a.coordinator.clone());
    let (a_result, b_result) = tokio::join!(a.coordinator.start_handshake(), b.start_handshake());
    b_result.unwrap();
    let bob_seen = a_result.unwrap();

    assert_eq!(bob_seen.ephemeral_id, bob_after.ephemeral_id());
    assert_eq!(bob_seen.pairing_state, PairingState::Paired);
    assert_eq!(bob_seen.addressing_id(), bob_after.persistent_id());
    assert_eq!(a.directory.len(), 1);
    assert_eq!(
        a.directory.pairing_secret_for(&bob_after.ephemeral_id()),
        Some([5u8; 32])
    );
}

#[tokio::test]
async fn test_stranger_sharing_display_name_stays_unpaired() {
    let (a, a_rx) = side("alice", 1, HandshakeConfig::default(), 185);
    let (b, b_rx) = side("bob", 2, HandshakeConfig::default(), 185);

    // Alice is paired with a different "bob".
    let other = common::identity("bob", 9);
    let mut record = PeerIdentity::unpaired(&other.ephemeral_id(), "bob").unwrap();
    record.upgrade_to_paired(other.persistent_public_key(), None);
    a.directory.upsert(record);

    pump(a_rx, b.coordinator.clone());
    pump(b_rx, a.coordinator.clone());
    let (a_result, b_result) = tokio::join!(
        a.coordinator.start_handshake(),
        b.coordinator.start_handshake()
    );

    assert_eq!(a_result.unwrap().pairing_state, PairingState::Unpaired);
    assert_eq!(b_result.unwrap().persistent_public_key, None);
    assert_eq!(a.directory.len(), 2);
    assert_eq!(a.directory.paired_peers().len(), 1);
}
