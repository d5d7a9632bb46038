// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Offline Message Queue
//!
//! Durable outbound store. Every message the application sends lives here
//! until the recipient confirms it, is withdrawn, or runs out of retries.
//! Records are kept in SQLite so a restart never loses an undelivered
//! message.

mod bandwidth;
mod migration;
mod offline;
mod policy;
mod scheduler;
mod store;

pub use bandwidth::QueueBandwidthAllocator;
pub use migration::{Migration, MigrationRunner};
pub use offline::OfflineMessageQueue;
pub use policy::QueuePolicyManager;
pub use scheduler::{RetryFired, RetryScheduler};
pub use store::QueueStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue for {recipient} is full ({limit} messages)")]
    CapacityExceeded { recipient: String, limit: usize },

    #[error("Queued message not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Delivery hand-off failed: {0}")]
    Delivery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Dispatch priority. Higher tiers always leave the queue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    /// Every tier, highest first.
    pub const DESCENDING: [MessagePriority; 4] = [
        MessagePriority::Urgent,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// One tier up, saturating at `Urgent`.
    pub fn boosted(self) -> Self {
        match self {
            MessagePriority::Low => MessagePriority::Normal,
            MessagePriority::Normal => MessagePriority::High,
            MessagePriority::High | MessagePriority::Urgent => MessagePriority::Urgent,
        }
    }

    pub(crate) fn as_i64(self) -> i64 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Urgent => 3,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => MessagePriority::Low,
            1 => MessagePriority::Normal,
            2 => MessagePriority::High,
            _ => MessagePriority::Urgent,
        }
    }
}

/// Lifecycle of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    /// An attempt is in flight; no second attempt may start.
    Sending,
    Retrying,
    /// Confirmed. The record is removed in the same step, so this status is
    /// only ever seen in events.
    Delivered,
    Failed,
}

impl QueueStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sending => "sending",
            QueueStatus::Retrying => "retrying",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "sending" => QueueStatus::Sending,
            "retrying" => QueueStatus::Retrying,
            "delivered" => QueueStatus::Delivered,
            "failed" => QueueStatus::Failed,
            _ => QueueStatus::Pending,
        }
    }

    /// Statuses that still occupy recipient capacity.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Sending | QueueStatus::Retrying
        )
    }
}

/// A durable outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Enqueue order, assigned by the store.
    pub seq: i64,
    pub id: String,
    pub chat_id: String,
    pub recipient_id: String,
    /// Plaintext application payload; sealed per attempt.
    pub payload: Vec<u8>,
    /// Effective priority (favorite boost already applied).
    pub priority: MessagePriority,
    pub status: QueueStatus,
    pub enqueued_at: u64,
    pub next_retry_at: Option<u64>,
    pub attempts: u32,
    pub expires_at: u64,
    pub last_attempt_at: Option<u64>,
    pub last_error: Option<String>,
    pub is_favorite: bool,
}

impl QueuedMessage {
    /// Returns true if the message may be attempted at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Sort key for dispatch: priority descending, then enqueue order.
    pub(crate) fn dispatch_key(&self) -> (std::cmp::Reverse<MessagePriority>, i64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

/// Queue counters. Status counts come from the store; the rest are totals
/// since the queue was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub pending: usize,
    pub sending: usize,
    pub retrying: usize,
    pub failed: usize,
    pub enqueued_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub expired_total: u64,
    pub withdrawn_total: u64,
    pub rejected_total: u64,
}

impl QueueStatistics {
    pub fn active(&self) -> usize {
        self.pending + self.sending + self.retrying
    }
}

/// What changed in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    Enqueued {
        message_id: String,
        priority: MessagePriority,
    },
    Sending {
        message_id: String,
        attempt: u32,
    },
    Retrying {
        message_id: String,
        attempts: u32,
        next_retry_at: u64,
    },
    Delivered {
        message_id: String,
    },
    Failed {
        message_id: String,
        reason: String,
    },
    Withdrawn {
        message_id: String,
    },
}

/// Published after every queue mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub change: QueueChange,
    pub statistics: QueueStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(MessagePriority::Urgent > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[test]
    fn test_boost_saturates() {
        assert_eq!(MessagePriority::Low.boosted(), MessagePriority::Normal);
        assert_eq!(MessagePriority::High.boosted(), MessagePriority::Urgent);
        assert_eq!(MessagePriority::Urgent.boosted(), MessagePriority::Urgent);
    }

    #[test]
    fn test_priority_column_mapping() {
        for priority in MessagePriority::DESCENDING {
            assert_eq!(MessagePriority::from_i64(priority.as_i64()), priority);
        }
    }

    #[test]
    fn test_status_column_mapping() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Sending,
            QueueStatus::Retrying,
            QueueStatus::Delivered,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), status);
        }
    }
}
