// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mesh Relay
//!
//! Forward/drop/block decisions for messages not addressed to this node.
//! Relays carry sealed content end to end; intermediate hops read only the
//! [`RelayMetadata`].

mod engine;
mod rate_limit;
mod strategy;

pub use engine::MeshRelayEngine;
pub use rate_limit::RateLimiter;
pub use strategy::{DiscoveryOrder, NextHopCandidate, NextHopStrategy, StrongestLink};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encryption::SealedContent;
use crate::queue::MessagePriority;

/// Relay errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Malformed relay metadata: {0}")]
    MalformedMetadata(String),

    #[error("Relay {message_id} dropped: {reason:?}")]
    Dropped {
        message_id: String,
        reason: DropReason,
    },

    #[error("Relay {message_id} blocked: {reason:?}")]
    Blocked {
        message_id: String,
        reason: BlockReason,
    },
}

/// Routing header of a relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetadata {
    pub original_message_id: String,
    pub original_sender: String,
    pub final_recipient: String,
    pub hop_count: u8,
    /// Routing ids of every node that has handled this relay, oldest first.
    pub visited_node_ids: Vec<String>,
    pub priority: MessagePriority,
}

impl RelayMetadata {
    /// Metadata for a relay this node originates: hop 0, visited by us only.
    pub fn originate(
        message_id: &str,
        original_sender: &str,
        final_recipient: &str,
        priority: MessagePriority,
        local_node_id: &str,
    ) -> Self {
        RelayMetadata {
            original_message_id: message_id.to_string(),
            original_sender: original_sender.to_string(),
            final_recipient: final_recipient.to_string(),
            hop_count: 0,
            visited_node_ids: vec![local_node_id.to_string()],
            priority,
        }
    }

    /// Metadata as forwarded by `node_id`: one more hop, `node_id` appended.
    pub fn forwarded_by(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        next.hop_count = self.hop_count.saturating_add(1);
        next.visited_node_ids.push(node_id.to_string());
        next
    }

    pub fn has_visited(&self, node_id: &str) -> bool {
        self.visited_node_ids.iter().any(|id| id == node_id)
    }
}

/// A relayed message: routing metadata plus untouched sealed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub metadata: RelayMetadata,
    pub content: SealedContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    HopLimit,
    Duplicate,
    NoRoute,
    AckTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    Loop,
    RateLimited,
    BlockedSender,
}

/// Outcome of a relay decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    DeliveredToSelf,
    Relayed { next_hop: String },
    Dropped(DropReason),
    Blocked(BlockReason),
    Error(String),
}

/// A forward awaiting transmission or acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayQueueEntry {
    pub relay_message: RelayMessage,
    pub next_hop_id: String,
    pub queued_at: u64,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
}

/// A relay the drain worker should transmit now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRelay {
    pub next_hop_id: String,
    pub message: RelayMessage,
}

/// What to do with an inbound relay ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// We originated the message; the queue can mark it delivered.
    Originator(String),
    /// Pass the ACK back towards the originator.
    Forward { previous_hop: String },
    /// Stale, duplicate, or from an unexpected neighbour.
    Unknown,
}

/// Relay counters, updated with each decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatistics {
    pub originated: u64,
    pub delivered_to_self: u64,
    pub relayed: u64,
    pub dropped_hop_limit: u64,
    pub dropped_duplicate: u64,
    pub dropped_no_route: u64,
    pub dropped_ack_timeout: u64,
    pub blocked_loop: u64,
    pub blocked_rate_limited: u64,
    pub blocked_sender: u64,
    pub errors: u64,
    pub transmissions: u64,
    pub send_failures: u64,
    pub acks_received: u64,
    pub acks_forwarded: u64,
    pub queued: usize,
}

impl RelayStatistics {
    pub fn total_dropped(&self) -> u64 {
        self.dropped_hop_limit
            + self.dropped_duplicate
            + self.dropped_no_route
            + self.dropped_ack_timeout
    }

    pub fn total_blocked(&self) -> u64 {
        self.blocked_loop + self.blocked_rate_limited + self.blocked_sender
    }

    fn record(&mut self, decision: &RelayDecision) {
        match decision {
            RelayDecision::DeliveredToSelf => self.delivered_to_self += 1,
            RelayDecision::Relayed { .. } => self.relayed += 1,
            RelayDecision::Dropped(DropReason::HopLimit) => self.dropped_hop_limit += 1,
            RelayDecision::Dropped(DropReason::Duplicate) => self.dropped_duplicate += 1,
            RelayDecision::Dropped(DropReason::NoRoute) => self.dropped_no_route += 1,
            RelayDecision::Dropped(DropReason::AckTimeout) => self.dropped_ack_timeout += 1,
            RelayDecision::Blocked(BlockReason::Loop) => self.blocked_loop += 1,
            RelayDecision::Blocked(BlockReason::RateLimited) => self.blocked_rate_limited += 1,
            RelayDecision::Blocked(BlockReason::BlockedSender) => self.blocked_sender += 1,
            RelayDecision::Error(_) => self.errors += 1,
        }
    }
}

/// Published after every relay decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub message_id: String,
    pub decision: RelayDecision,
    pub statistics: RelayStatistics,
}
