// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Queue policy: favorite boost, capacity limits, retry backoff, expiry.

use super::{MessagePriority, QueueError};
use crate::config::QueueConfig;

/// Decides how messages enter the queue and how failures are retried.
#[derive(Debug, Clone)]
pub struct QueuePolicyManager {
    config: QueueConfig,
}

impl QueuePolicyManager {
    pub fn new(config: QueueConfig) -> Self {
        QueuePolicyManager { config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Priority a message is stored with. Favorites are boosted one tier,
    /// once, at enqueue time.
    pub fn effective_priority(
        &self,
        requested: MessagePriority,
        is_favorite: bool,
    ) -> MessagePriority {
        if is_favorite && self.config.favorite_boost {
            requested.boosted()
        } else {
            requested
        }
    }

    /// Maximum active messages for one recipient.
    pub fn capacity_for(&self, is_favorite: bool) -> usize {
        if is_favorite {
            self.config.favorite_limit
        } else {
            self.config.per_recipient_limit
        }
    }

    /// Fails fast when a recipient already holds its limit. Nothing is
    /// evicted to make room.
    pub fn check_capacity(
        &self,
        recipient_id: &str,
        is_favorite: bool,
        active: usize,
    ) -> Result<(), QueueError> {
        let limit = self.capacity_for(is_favorite);
        if active >= limit {
            return Err(QueueError::CapacityExceeded {
                recipient: recipient_id.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Delay before retry after `attempts` failed attempts: base, 2×base,
    /// 4×base, ... capped.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(63);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.config
            .backoff_base_ms
            .saturating_mul(multiplier)
            .min(self.config.backoff_cap_ms)
    }

    /// Returns true once a message has used up its retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.config.max_retries
    }

    pub fn expiry_for(&self, enqueued_at: u64) -> u64 {
        enqueued_at.saturating_add(self.config.default_ttl_ms)
    }
}
