// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Handshake
//!
//! Every new link runs three acknowledged, symmetric phases before any
//! application traffic: ready (protocol version and MTU), identity
//! (ephemeral id and display name), and contact status (whether each side
//! already knows the other). Each phase waits for the peer's ACK of our
//! message and for the peer's own message, under its own timeout.

mod coordinator;

pub use coordinator::{HandshakeCoordinator, PeerChannel};

use thiserror::Error;

use crate::transport::{CodecError, TransportError};

/// Handshake progress. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Connected,
    ReadySent,
    ReadyAckWaiting,
    ReadyComplete,
    IdentitySent,
    IdentityAckWaiting,
    IdentityComplete,
    ContactStatusSent,
    ContactStatusAckWaiting,
    ContactStatusComplete,
    SessionReady,
    Complete,
    Timeout,
    Failed,
}

impl ConnectionPhase {
    /// Position in the phase order. `Timeout` and `Failed` outrank every
    /// other phase so they are reachable from any of them.
    pub fn rank(self) -> u8 {
        match self {
            ConnectionPhase::Connected => 0,
            ConnectionPhase::ReadySent => 1,
            ConnectionPhase::ReadyAckWaiting => 2,
            ConnectionPhase::ReadyComplete => 3,
            ConnectionPhase::IdentitySent => 4,
            ConnectionPhase::IdentityAckWaiting => 5,
            ConnectionPhase::IdentityComplete => 6,
            ConnectionPhase::ContactStatusSent => 7,
            ConnectionPhase::ContactStatusAckWaiting => 8,
            ConnectionPhase::ContactStatusComplete => 9,
            ConnectionPhase::SessionReady => 10,
            ConnectionPhase::Complete => 11,
            ConnectionPhase::Timeout | ConnectionPhase::Failed => 12,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Complete | ConnectionPhase::Timeout | ConnectionPhase::Failed
        )
    }

    /// Returns true if moving from `self` to `next` keeps the order.
    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Handshake errors. All of them end the attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake timed out in {phase:?}")]
    Timeout { phase: ConnectionPhase },

    #[error("Handshake rejected in {phase:?}: {reason}")]
    Rejected {
        phase: ConnectionPhase,
        reason: String,
    },

    #[error("Handshake cancelled")]
    Cancelled,

    #[error("Handshake already finished ({0:?})")]
    AlreadyFinished(ConnectionPhase),

    #[error("Application message before handshake completed")]
    NotComplete,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Published on every phase change of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub link_id: String,
    pub phase: ConnectionPhase,
}
