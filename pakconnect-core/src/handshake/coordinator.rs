// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-link handshake state machine.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ConnectionPhase, HandshakeError, PhaseEvent};
use crate::clock::now_millis;
use crate::config::HandshakeConfig;
use crate::crypto::{PublicKey, Signature};
use crate::events::Publisher;
use crate::identity::{verify_contact_proof, ContactDirectory, LocalIdentity, PeerIdentity};
use crate::transport::{
    ConnectionReady, ConnectionReadyAck, ContactStatus, HandshakeReject, Identity, IdentityAck,
    Payload, ProtocolMessage, TransportError,
};

/// Outbound path to the peer on the other end of a link.
pub trait PeerChannel: Send + Sync {
    fn send(&self, message: ProtocolMessage) -> Result<(), TransportError>;
}

/// Everything learned so far on this link. Peer messages are recorded as
/// they arrive, even before the local side reaches that phase.
#[derive(Clone)]
struct HandshakeState {
    phase: ConnectionPhase,
    ready_acked: bool,
    peer_ready: Option<ConnectionReady>,
    identity_acked: bool,
    peer_identity: Option<Identity>,
    status_acked: bool,
    peer_status: Option<(ContactStatus, Option<Signature>)>,
    rejected: Option<String>,
    cancelled: bool,
    resolved: Option<PeerIdentity>,
}

impl Default for HandshakeState {
    fn default() -> Self {
        HandshakeState {
            phase: ConnectionPhase::Connected,
            ready_acked: false,
            peer_ready: None,
            identity_acked: false,
            peer_identity: None,
            status_acked: false,
            peer_status: None,
            rejected: None,
            cancelled: false,
            resolved: None,
        }
    }
}

#[derive(Clone, Copy)]
enum Signer {
    Unsigned,
    Ephemeral,
    Persistent,
}

enum Wait {
    Satisfied,
    TimedOut,
    Rejected(String),
    Cancelled,
}

/// Drives one link through the handshake phases.
///
/// Both ends run [`start_handshake`](Self::start_handshake); inbound
/// handshake messages are fed through [`handle_message`](Self::handle_message)
/// from the link's dispatch loop.
pub struct HandshakeCoordinator {
    link_id: String,
    identity: Arc<LocalIdentity>,
    directory: Arc<dyn ContactDirectory>,
    channel: Arc<dyn PeerChannel>,
    config: HandshakeConfig,
    local_mtu: usize,
    state: watch::Sender<HandshakeState>,
    phases: Publisher<PhaseEvent>,
}

impl HandshakeCoordinator {
    pub fn new(
        link_id: &str,
        identity: Arc<LocalIdentity>,
        directory: Arc<dyn ContactDirectory>,
        channel: Arc<dyn PeerChannel>,
        config: HandshakeConfig,
        local_mtu: usize,
        phases: Publisher<PhaseEvent>,
    ) -> Self {
        let (state, _) = watch::channel(HandshakeState::default());
        HandshakeCoordinator {
            link_id: link_id.to_string(),
            identity,
            directory,
            channel,
            config,
            local_mtu,
            state,
            phases,
        }
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == ConnectionPhase::Complete
    }

    /// The resolved peer, once the handshake completed.
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.state.borrow().resolved.clone()
    }

    /// Smaller of both sides' MTUs, once the peer's ready message arrived.
    pub fn negotiated_mtu(&self) -> Option<usize> {
        self.state
            .borrow()
            .peer_ready
            .as_ref()
            .map(|ready| usize::from(ready.mtu).min(self.local_mtu))
    }

    /// Runs every phase to completion and returns the resolved peer.
    ///
    /// Fails on the first timeout, rejection or cancellation; nothing is
    /// retried within one attempt.
    pub async fn start_handshake(&self) -> Result<PeerIdentity, HandshakeError> {
        let phase = self.phase();
        if phase != ConnectionPhase::Connected {
            return Err(HandshakeError::AlreadyFinished(phase));
        }
        info!(link = %self.link_id, "Handshake started");

        // Ready
        self.send_phase(
            ConnectionPhase::ReadySent,
            Payload::ConnectionReady(ConnectionReady {
                protocol_version: self.config.protocol_version,
                mtu: u16::try_from(self.local_mtu).unwrap_or(u16::MAX),
            }),
            Signer::Unsigned,
        )?;
        self.await_phase(ConnectionPhase::ReadyAckWaiting, |s| {
            s.ready_acked && s.peer_ready.is_some()
        })
        .await?;
        self.set_phase(ConnectionPhase::ReadyComplete);

        // Identity
        self.send_phase(
            ConnectionPhase::IdentitySent,
            Payload::Identity(Identity {
                ephemeral_id: self.identity.ephemeral_id(),
                display_name: self.identity.display_name().to_string(),
                contact_proof: self.identity.contact_proof().as_bytes().to_vec(),
            }),
            Signer::Ephemeral,
        )?;
        self.await_phase(ConnectionPhase::IdentityAckWaiting, |s| {
            s.identity_acked && s.peer_identity.is_some()
        })
        .await?;
        self.set_phase(ConnectionPhase::IdentityComplete);

        // Contact status
        let peer_identity = self
            .state
            .borrow()
            .peer_identity
            .clone()
            .ok_or(HandshakeError::Cancelled)?;
        let known = self.known_peer(&peer_identity);
        let (status, signer) = self.local_contact_status(known.as_ref());
        self.send_phase(
            ConnectionPhase::ContactStatusSent,
            Payload::ContactStatus(status),
            signer,
        )?;
        self.await_phase(ConnectionPhase::ContactStatusAckWaiting, |s| {
            s.status_acked && s.peer_status.is_some()
        })
        .await?;

        let peer_status = self.state.borrow().peer_status.clone();
        let resolved = match peer_status {
            Some((status, signature)) => {
                self.resolve_peer(&peer_identity, known, &status, signature.as_ref())
            }
            None => Err("Contact status missing".to_string()),
        };
        let peer = match resolved {
            Ok(peer) => peer,
            Err(reason) => {
                let phase = self.phase();
                let _ = self.reject(&reason);
                self.set_phase(ConnectionPhase::Failed);
                return Err(HandshakeError::Rejected { phase, reason });
            }
        };
        self.set_phase(ConnectionPhase::ContactStatusComplete);

        self.directory.upsert(peer.clone());
        self.state.send_modify(|s| s.resolved = Some(peer.clone()));
        self.set_phase(ConnectionPhase::SessionReady);
        self.set_phase(ConnectionPhase::Complete);
        info!(
            link = %self.link_id,
            peer = %peer.ephemeral_id,
            name = %peer.display_name,
            pairing = ?peer.pairing_state,
            "Handshake complete"
        );
        Ok(peer)
    }

    /// Feeds one inbound message from the peer.
    ///
    /// Phase messages are recorded and acknowledged at once, whatever phase
    /// the local side is in. Application messages are refused until the
    /// handshake is complete. Once the attempt has ended nothing more is
    /// sent.
    pub fn handle_message(&self, message: &ProtocolMessage) -> Result<(), HandshakeError> {
        let phase = self.phase();
        if !message.message_type().is_handshake() {
            return if phase == ConnectionPhase::Complete {
                Ok(())
            } else {
                Err(HandshakeError::NotComplete)
            };
        }
        if phase.is_terminal() {
            debug!(
                link = %self.link_id,
                message_type = ?message.message_type(),
                phase = ?phase,
                "Ignoring handshake message after attempt ended"
            );
            return Ok(());
        }

        match &message.payload {
            Payload::ConnectionReady(ready) => {
                if ready.protocol_version != self.config.protocol_version {
                    return self.reject(&format!(
                        "Unsupported protocol version {} (expected {})",
                        ready.protocol_version, self.config.protocol_version
                    ));
                }
                self.state
                    .send_modify(|s| s.peer_ready = Some(ready.clone()));
                self.send(
                    Payload::ConnectionReadyAck(ConnectionReadyAck {
                        protocol_version: self.config.protocol_version,
                    }),
                    Signer::Unsigned,
                )
            }
            Payload::ConnectionReadyAck(ack) => {
                if ack.protocol_version != self.config.protocol_version {
                    return self.reject(&format!(
                        "Unsupported protocol version {} (expected {})",
                        ack.protocol_version, self.config.protocol_version
                    ));
                }
                self.state.send_modify(|s| s.ready_acked = true);
                Ok(())
            }
            Payload::Identity(identity) => {
                if let Err(reason) = self.check_identity(identity, message) {
                    return self.reject(&reason);
                }
                self.state
                    .send_modify(|s| s.peer_identity = Some(identity.clone()));
                self.send(
                    Payload::IdentityAck(IdentityAck {
                        ephemeral_id: self.identity.ephemeral_id(),
                    }),
                    Signer::Unsigned,
                )
            }
            Payload::IdentityAck(_) => {
                self.state.send_modify(|s| s.identity_acked = true);
                Ok(())
            }
            Payload::ContactStatus(status) => {
                let signature = message.signature;
                self.state
                    .send_modify(|s| s.peer_status = Some((status.clone(), signature)));
                self.send(Payload::ContactStatusAck, Signer::Unsigned)
            }
            Payload::ContactStatusAck => {
                self.state.send_modify(|s| s.status_acked = true);
                Ok(())
            }
            Payload::HandshakeReject(reject) => {
                warn!(
                    link = %self.link_id,
                    phase = ?phase,
                    reason = %reject.reason,
                    "Peer rejected handshake"
                );
                self.state
                    .send_modify(|s| s.rejected = Some(reject.reason.clone()));
                Ok(())
            }
            Payload::Direct(_)
            | Payload::DeliveryAck(_)
            | Payload::Relay(_)
            | Payload::RelayAck(_)
            | Payload::PairingRequest(_)
            | Payload::PairingConfirm(_) => Err(HandshakeError::NotComplete),
        }
    }

    /// Aborts the attempt (link teardown). A pending phase wait returns
    /// [`HandshakeError::Cancelled`].
    pub fn cancel(&self) {
        self.state.send_modify(|s| s.cancelled = true);
        if self.set_phase(ConnectionPhase::Failed) {
            info!(link = %self.link_id, "Handshake cancelled");
        }
    }

    // === Internals ===

    fn set_phase(&self, next: ConnectionPhase) -> bool {
        let advanced = self.state.send_if_modified(|s| {
            if s.phase.can_advance_to(next) {
                s.phase = next;
                true
            } else {
                false
            }
        });
        if advanced {
            debug!(link = %self.link_id, phase = ?next, "Handshake phase");
            self.phases.publish(PhaseEvent {
                link_id: self.link_id.clone(),
                phase: next,
            });
        }
        advanced
    }

    fn send(&self, payload: Payload, signer: Signer) -> Result<(), HandshakeError> {
        let mut message = ProtocolMessage::new(payload, now_millis());
        let signature = match signer {
            Signer::Unsigned => None,
            Signer::Ephemeral => Some(
                self.identity
                    .sign_ephemeral(&message.payload.signing_bytes()?),
            ),
            Signer::Persistent => Some(
                self.identity
                    .sign_persistent(&message.payload.signing_bytes()?),
            ),
        };
        if let Some(signature) = signature {
            message = message.with_signature(signature);
        }
        self.channel.send(message)?;
        Ok(())
    }

    fn send_phase(
        &self,
        phase: ConnectionPhase,
        payload: Payload,
        signer: Signer,
    ) -> Result<(), HandshakeError> {
        if let Some(error) = self.ended() {
            return Err(error);
        }
        self.set_phase(phase);
        if let Err(e) = self.send(payload, signer) {
            warn!(link = %self.link_id, phase = ?phase, error = %e, "Handshake send failed");
            self.set_phase(ConnectionPhase::Failed);
            return Err(e);
        }
        Ok(())
    }

    /// Error for an attempt that was already ended by the peer or teardown.
    fn ended(&self) -> Option<HandshakeError> {
        let state = self.state.borrow();
        if state.cancelled {
            return Some(HandshakeError::Cancelled);
        }
        state.rejected.as_ref().map(|reason| HandshakeError::Rejected {
            phase: state.phase,
            reason: reason.clone(),
        })
    }

    async fn await_phase(
        &self,
        waiting: ConnectionPhase,
        done: fn(&HandshakeState) -> bool,
    ) -> Result<(), HandshakeError> {
        self.set_phase(waiting);
        let mut rx = self.state.subscribe();
        let outcome = tokio::time::timeout(
            self.config.phase_timeout(),
            rx.wait_for(|s| s.cancelled || s.rejected.is_some() || done(s)),
        )
        .await;

        let wait = match outcome {
            Err(_) => Wait::TimedOut,
            Ok(Err(_)) => Wait::Cancelled,
            Ok(Ok(state)) => {
                if state.cancelled {
                    Wait::Cancelled
                } else if let Some(reason) = &state.rejected {
                    Wait::Rejected(reason.clone())
                } else {
                    Wait::Satisfied
                }
            }
        };

        match wait {
            Wait::Satisfied => Ok(()),
            Wait::TimedOut => {
                warn!(link = %self.link_id, phase = ?waiting, "Handshake phase timed out");
                self.set_phase(ConnectionPhase::Timeout);
                Err(HandshakeError::Timeout { phase: waiting })
            }
            Wait::Rejected(reason) => {
                self.set_phase(ConnectionPhase::Failed);
                Err(HandshakeError::Rejected {
                    phase: waiting,
                    reason,
                })
            }
            Wait::Cancelled => {
                self.set_phase(ConnectionPhase::Failed);
                Err(HandshakeError::Cancelled)
            }
        }
    }

    /// Sends a rejection and ends the attempt.
    fn reject(&self, reason: &str) -> Result<(), HandshakeError> {
        warn!(link = %self.link_id, reason = %reason, "Rejecting handshake");
        self.state
            .send_modify(|s| s.rejected = Some(reason.to_string()));
        self.send(
            Payload::HandshakeReject(HandshakeReject {
                reason: reason.to_string(),
            }),
            Signer::Unsigned,
        )
    }

    fn check_identity(&self, identity: &Identity, message: &ProtocolMessage) -> Result<(), String> {
        PeerIdentity::unpaired(&identity.ephemeral_id, &identity.display_name)
            .map_err(|e| e.to_string())?;
        if self.identity.is_local_id(&identity.ephemeral_id) {
            return Err("Peer presented our own identity".to_string());
        }
        let key = PublicKey::from_fingerprint(&identity.ephemeral_id)
            .ok_or_else(|| format!("Malformed peer id: {}", identity.ephemeral_id))?;
        let signature = message
            .signature
            .as_ref()
            .ok_or_else(|| "Identity is not signed".to_string())?;
        let signed = message.payload.signing_bytes().map_err(|e| e.to_string())?;
        if !key.verify(&signed, signature) {
            return Err("Identity signature invalid".to_string());
        }
        Ok(())
    }

    /// Directory record for the peer on this link. A paired contact that
    /// reconnected under a new ephemeral id is found by its contact proof.
    fn known_peer(&self, identity: &Identity) -> Option<PeerIdentity> {
        if let Some(peer) = self.directory.lookup(&identity.ephemeral_id) {
            return Some(peer);
        }
        let found = self.directory.paired_peers().into_iter().find(|peer| {
            peer.persistent_public_key.is_some_and(|key| {
                verify_contact_proof(&key, &identity.ephemeral_id, &identity.contact_proof)
            })
        });
        if let Some(peer) = &found {
            info!(
                link = %self.link_id,
                previous = %peer.ephemeral_id,
                current = %identity.ephemeral_id,
                "Paired contact reconnected under a new ephemeral id"
            );
        }
        found
    }

    /// Our contact-status message for a peer. Keys are revealed only to a
    /// peer the directory already records as paired.
    fn local_contact_status(&self, known: Option<&PeerIdentity>) -> (ContactStatus, Signer) {
        if known.is_some_and(|peer| peer.is_paired()) {
            (
                ContactStatus {
                    is_contact: true,
                    persistent_key: Some(self.identity.persistent_public_key()),
                    exchange_key: Some(self.identity.exchange_public_key()),
                },
                Signer::Persistent,
            )
        } else {
            (
                ContactStatus {
                    is_contact: false,
                    persistent_key: None,
                    exchange_key: None,
                },
                Signer::Ephemeral,
            )
        }
    }

    /// Verifies the peer's contact status and builds the identity to store.
    fn resolve_peer(
        &self,
        identity: &Identity,
        known: Option<PeerIdentity>,
        status: &ContactStatus,
        signature: Option<&Signature>,
    ) -> Result<PeerIdentity, String> {
        let signer = match status.persistent_key {
            Some(key) => PublicKey::from_bytes(key),
            None => PublicKey::from_fingerprint(&identity.ephemeral_id)
                .ok_or_else(|| format!("Malformed peer id: {}", identity.ephemeral_id))?,
        };
        let signature = signature.ok_or_else(|| "Contact status is not signed".to_string())?;
        let signed = Payload::ContactStatus(status.clone())
            .signing_bytes()
            .map_err(|e| e.to_string())?;
        if !signer.verify(&signed, signature) {
            return Err("Contact status signature invalid".to_string());
        }

        // Storing the record under the new ephemeral id re-keys it in the
        // directory through the persistent key.
        let mut peer = match known {
            Some(mut known) => {
                known.ephemeral_id = identity.ephemeral_id.clone();
                known.display_name = identity.display_name.clone();
                known
            }
            None => PeerIdentity::unpaired(&identity.ephemeral_id, &identity.display_name)
                .map_err(|e| e.to_string())?,
        };

        if let (true, Some(key)) = (peer.is_paired(), status.persistent_key) {
            if peer.persistent_public_key.is_some_and(|known| known != key) {
                return Err("Persistent key does not match paired contact".to_string());
            }
            peer.upgrade_to_paired(key, status.exchange_key);
        }
        Ok(peer)
    }
}
