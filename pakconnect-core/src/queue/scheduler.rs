// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-message retry timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A retry timer went off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFired {
    pub message_id: String,
    pub generation: u64,
}

struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// One tokio timer per queued message.
///
/// Every schedule bumps the message's generation. A fired timer whose
/// generation is no longer current belongs to a cancelled or superseded
/// schedule and must be ignored.
pub struct RetryScheduler {
    timers: Mutex<HashMap<String, Timer>>,
    next_generation: AtomicU64,
    fired_tx: mpsc::UnboundedSender<RetryFired>,
}

impl RetryScheduler {
    /// Creates a scheduler and the receiver its timers fire into.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RetryFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = RetryScheduler {
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            fired_tx,
        };
        (scheduler, fired_rx)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, Timer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arms (or re-arms) the timer for `message_id`. Returns its generation.
    ///
    /// Outside a tokio runtime no task is spawned; the generation is still
    /// recorded and due messages are found by polling the queue instead.
    pub fn schedule(&self, message_id: &str, delay: Duration) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Handle::try_current().ok().map(|runtime| {
            let tx = self.fired_tx.clone();
            let fired = RetryFired {
                message_id: message_id.to_string(),
                generation,
            };
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(fired);
            })
        });

        let previous = self.timers().insert(
            message_id.to_string(),
            Timer { generation, handle },
        );
        if let Some(handle) = previous.and_then(|timer| timer.handle) {
            handle.abort();
        }
        debug!(
            message_id = %message_id,
            generation,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        generation
    }

    /// Cancels the timer for `message_id`. Returns true if one was armed.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.timers().remove(message_id) {
            Some(timer) => {
                if let Some(handle) = timer.handle {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Consumes a fired timer. Returns true only for the current generation;
    /// the timer is disarmed in that case.
    pub fn take_fired(&self, fired: &RetryFired) -> bool {
        let mut timers = self.timers();
        let current = timers
            .get(&fired.message_id)
            .is_some_and(|timer| timer.generation == fired.generation);
        if current {
            timers.remove(&fired.message_id);
        }
        current
    }

    pub fn is_armed(&self, message_id: &str) -> bool {
        self.timers().contains_key(message_id)
    }

    pub fn armed(&self) -> usize {
        self.timers().len()
    }

    /// Aborts every timer.
    pub fn shutdown(&self) {
        for (_, timer) in self.timers().drain() {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
