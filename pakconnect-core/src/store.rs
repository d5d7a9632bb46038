// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message store seam.
//!
//! Chat history lives outside the core. The core hands every confirmed
//! outbound message and every verified inbound message to a [`MessageStore`]
//! through a single `deliver` call.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Message store rejected {message_id}: {reason}")]
    Rejected { message_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A message handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub chat_id: String,
    /// The other party: recipient for outbound, sender for inbound.
    pub peer_id: String,
    pub content: Vec<u8>,
    pub timestamp: u64,
    pub direction: Direction,
}

/// Chat history storage consumed by the core.
pub trait MessageStore: Send + Sync {
    fn deliver(&self, message: DeliveredMessage) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    delivered: Vec<DeliveredMessage>,
    fail_next: usize,
}

/// In-memory store for tests and simulations.
#[derive(Default)]
pub struct InMemoryMessageStore {
    state: Mutex<MemoryState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rejects the next `count` deliveries.
    pub fn fail_next(&self, count: usize) {
        self.state().fail_next = count;
    }

    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.state().delivered.clone()
    }

    pub fn inbound(&self) -> Vec<DeliveredMessage> {
        self.state()
            .delivered
            .iter()
            .filter(|m| m.direction == Direction::Inbound)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for InMemoryMessageStore {
    fn deliver(&self, message: DeliveredMessage) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Rejected {
                message_id: message.message_id,
                reason: "injected failure".into(),
            });
        }
        state.delivered.push(message);
        Ok(())
    }
}
