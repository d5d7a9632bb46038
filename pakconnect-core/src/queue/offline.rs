// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The outbound queue: enqueue, attempt, confirm, retry, expire.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bandwidth::QueueBandwidthAllocator;
use super::policy::QueuePolicyManager;
use super::scheduler::{RetryFired, RetryScheduler};
use super::store::QueueStore;
use super::{
    MessagePriority, QueueChange, QueueError, QueueEvent, QueueStatistics, QueueStatus,
    QueuedMessage,
};
use crate::config::QueueConfig;
use crate::events::Publisher;
use crate::identity::ContactDirectory;
use crate::store::{DeliveredMessage, Direction, MessageStore};

/// Durable, priority-ordered, retry-scheduled outbound store.
///
/// Each message has at most one attempt in flight: [`begin_attempt`] claims
/// it and only [`mark_delivered`] or [`mark_failed_attempt`] release it.
///
/// [`begin_attempt`]: OfflineMessageQueue::begin_attempt
/// [`mark_delivered`]: OfflineMessageQueue::mark_delivered
/// [`mark_failed_attempt`]: OfflineMessageQueue::mark_failed_attempt
pub struct OfflineMessageQueue {
    store: Mutex<QueueStore>,
    policy: QueuePolicyManager,
    allocator: QueueBandwidthAllocator,
    scheduler: RetryScheduler,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<RetryFired>>>,
    directory: Arc<dyn ContactDirectory>,
    message_store: Arc<dyn MessageStore>,
    totals: Mutex<QueueStatistics>,
    events: Publisher<QueueEvent>,
}

impl OfflineMessageQueue {
    /// Wraps an opened store and recovers from an unclean shutdown.
    ///
    /// Records left in `sending` are moved to `retrying`; retry timers are
    /// re-armed for records still waiting on their backoff.
    pub fn new(
        store: QueueStore,
        config: QueueConfig,
        directory: Arc<dyn ContactDirectory>,
        message_store: Arc<dyn MessageStore>,
        events: Publisher<QueueEvent>,
        now: u64,
    ) -> Result<Self, QueueError> {
        let (scheduler, retry_rx) = RetryScheduler::new();
        let recovered = store.recover_sending()?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted queue attempts");
        }

        let queue = OfflineMessageQueue {
            allocator: QueueBandwidthAllocator::new(config.bandwidth_window_bytes),
            policy: QueuePolicyManager::new(config),
            store: Mutex::new(store),
            scheduler,
            retry_rx: Mutex::new(Some(retry_rx)),
            directory,
            message_store,
            totals: Mutex::new(QueueStatistics::default()),
            events,
        };

        for message in queue.store().by_status(QueueStatus::Retrying)? {
            if let Some(at) = message.next_retry_at.filter(|at| *at > now) {
                queue
                    .scheduler
                    .schedule(&message.id, Duration::from_millis(at - now));
            }
        }
        Ok(queue)
    }

    fn store(&self) -> MutexGuard<'_, QueueStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn totals(&self) -> MutexGuard<'_, QueueStatistics> {
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> &QueuePolicyManager {
        &self.policy
    }

    /// Receiver for retry timers. Handed out once, to the dispatch loop.
    pub fn take_retry_receiver(&self) -> Option<mpsc::UnboundedReceiver<RetryFired>> {
        self.retry_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    // === Enqueue ===

    /// Persists a message and returns its id.
    ///
    /// Fails with [`QueueError::CapacityExceeded`] when the recipient already
    /// holds its limit; nothing already queued is evicted.
    pub fn enqueue(
        &self,
        chat_id: &str,
        recipient_id: &str,
        payload: &[u8],
        priority: MessagePriority,
        now: u64,
    ) -> Result<String, QueueError> {
        let is_favorite = self.directory.is_favorite(recipient_id);
        let message = {
            let store = self.store();
            let active = store.count_active_for(recipient_id)?;
            if let Err(e) = self.policy.check_capacity(recipient_id, is_favorite, active) {
                self.totals().rejected_total += 1;
                warn!(recipient = %recipient_id, active, "Queue capacity exceeded");
                return Err(e);
            }

            let mut message = QueuedMessage {
                seq: 0,
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                recipient_id: recipient_id.to_string(),
                payload: payload.to_vec(),
                priority: self.policy.effective_priority(priority, is_favorite),
                status: QueueStatus::Pending,
                enqueued_at: now,
                next_retry_at: None,
                attempts: 0,
                expires_at: self.policy.expiry_for(now),
                last_attempt_at: None,
                last_error: None,
                is_favorite,
            };
            message.seq = store.insert(&message)?;
            message
        };

        self.totals().enqueued_total += 1;
        debug!(
            message_id = %message.id,
            recipient = %recipient_id,
            priority = ?message.priority,
            "Message enqueued"
        );
        self.publish(QueueChange::Enqueued {
            message_id: message.id.clone(),
            priority: message.priority,
        });
        Ok(message.id)
    }

    // === Dispatch ===

    /// Messages that may be attempted now, in dispatch order.
    pub fn dispatchable(&self, now: u64) -> Result<Vec<QueuedMessage>, QueueError> {
        self.store().due(now)
    }

    /// Due messages accepted by `reachable`, trimmed to one bandwidth window.
    pub fn dispatchable_within<F>(
        &self,
        now: u64,
        reachable: F,
    ) -> Result<Vec<QueuedMessage>, QueueError>
    where
        F: Fn(&QueuedMessage) -> bool,
    {
        let candidates: Vec<QueuedMessage> = self
            .dispatchable(now)?
            .into_iter()
            .filter(|m| reachable(m))
            .collect();
        Ok(self.allocator.allocate(&candidates))
    }

    /// Claims a message for an attempt.
    ///
    /// Returns None if the message is gone or another attempt holds it.
    pub fn begin_attempt(&self, id: &str, now: u64) -> Result<Option<QueuedMessage>, QueueError> {
        let message = {
            let store = self.store();
            if !store.mark_sending(id, now)? {
                return Ok(None);
            }
            store.get(id)?
        };
        self.scheduler.cancel(id);

        if let Some(message) = &message {
            self.publish(QueueChange::Sending {
                message_id: message.id.clone(),
                attempt: message.attempts,
            });
        }
        Ok(message)
    }

    /// Confirms delivery: hands the message to the message store and removes
    /// the record as one step. If the store rejects it, the record stays.
    ///
    /// Returns false if no such message is queued (duplicate confirmation).
    pub fn mark_delivered(&self, id: &str, now: u64) -> Result<bool, QueueError> {
        let removed = self.store().remove_with(id, |message| {
            self.message_store
                .deliver(DeliveredMessage {
                    message_id: message.id.clone(),
                    chat_id: message.chat_id.clone(),
                    peer_id: message.recipient_id.clone(),
                    content: message.payload.clone(),
                    timestamp: now,
                    direction: Direction::Outbound,
                })
                .map_err(|e| QueueError::Delivery(e.to_string()))
        })?;

        let Some(message) = removed else {
            debug!(message_id = %id, "Delivery confirmation for unknown message");
            return Ok(false);
        };

        self.scheduler.cancel(id);
        self.totals().delivered_total += 1;
        info!(
            message_id = %id,
            recipient = %message.recipient_id,
            attempts = message.attempts,
            "Message delivered"
        );
        self.publish(QueueChange::Delivered {
            message_id: id.to_string(),
        });
        Ok(true)
    }

    /// Records a failed attempt. Schedules a backoff retry, or fails the
    /// message once its retry budget is spent. Returns the new status.
    pub fn mark_failed_attempt(
        &self,
        id: &str,
        error: &str,
        now: u64,
    ) -> Result<QueueStatus, QueueError> {
        // Everything up to arming the timer holds one store guard; a
        // concurrent delivery or withdrawal cannot leave a timer armed for a
        // deleted record.
        let (message, retry) = {
            let store = self.store();
            let message = store
                .get(id)?
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if message.status != QueueStatus::Sending {
                return Ok(message.status);
            }

            if self.policy.is_exhausted(message.attempts) {
                if !store.mark_attempt_failed(id, error)? {
                    return current_status(&store, id);
                }
                self.scheduler.cancel(id);
                (message, None)
            } else {
                let delay = self.policy.backoff_delay_ms(message.attempts);
                let next_retry_at = now.saturating_add(delay);
                if !store.mark_retrying(id, next_retry_at, error)? {
                    return current_status(&store, id);
                }
                self.scheduler.schedule(id, Duration::from_millis(delay));
                (message, Some((delay, next_retry_at)))
            }
        };

        let Some((delay, next_retry_at)) = retry else {
            self.totals().failed_total += 1;
            warn!(
                message_id = %id,
                attempts = message.attempts,
                error = %error,
                "Message failed after exhausting retries"
            );
            self.publish(QueueChange::Failed {
                message_id: id.to_string(),
                reason: error.to_string(),
            });
            return Ok(QueueStatus::Failed);
        };

        debug!(
            message_id = %id,
            attempts = message.attempts,
            delay_ms = delay,
            error = %error,
            "Attempt failed, retry scheduled"
        );
        self.publish(QueueChange::Retrying {
            message_id: id.to_string(),
            attempts: message.attempts,
            next_retry_at,
        });
        Ok(QueueStatus::Retrying)
    }

    /// Deletes a message and cancels its timer.
    pub fn withdraw(&self, id: &str) -> Result<bool, QueueError> {
        let removed = self.store().delete(id)?;
        self.scheduler.cancel(id);
        if removed {
            self.totals().withdrawn_total += 1;
            debug!(message_id = %id, "Message withdrawn");
            self.publish(QueueChange::Withdrawn {
                message_id: id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Fails every active message past its deadline. The records stay in
    /// the queue as `failed` so the application can report them.
    pub fn expire(&self, now: u64) -> Result<Vec<String>, QueueError> {
        let expired = self.store().expired(now)?;
        let mut ids = Vec::with_capacity(expired.len());
        for message in expired {
            self.store().mark_failed(&message.id, "expired")?;
            self.scheduler.cancel(&message.id);
            {
                let mut totals = self.totals();
                totals.expired_total += 1;
                totals.failed_total += 1;
            }
            warn!(message_id = %message.id, recipient = %message.recipient_id, "Message expired");
            self.publish(QueueChange::Failed {
                message_id: message.id.clone(),
                reason: "expired".into(),
            });
            ids.push(message.id);
        }
        Ok(ids)
    }

    /// Treats attempts still unconfirmed after the direct ACK timeout as
    /// failed. Returns the affected ids.
    pub fn reap_unacked(&self, now: u64) -> Result<Vec<String>, QueueError> {
        let cutoff = now.saturating_sub(self.policy.config().direct_ack_timeout_ms);
        let stale = self.store().sending_since(cutoff)?;
        let mut ids = Vec::with_capacity(stale.len());
        for message in stale {
            self.mark_failed_attempt(&message.id, "delivery not acknowledged", now)?;
            ids.push(message.id);
        }
        Ok(ids)
    }

    /// Resolves a fired retry timer. Returns the message if it is still
    /// waiting and now due; stale timers resolve to None.
    pub fn on_retry_fired(
        &self,
        fired: &RetryFired,
        now: u64,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        if !self.scheduler.take_fired(fired) {
            return Ok(None);
        }
        Ok(self
            .store()
            .get(&fired.message_id)?
            .filter(|message| message.is_due(now)))
    }

    // === Queries ===

    pub fn get(&self, id: &str) -> Result<Option<QueuedMessage>, QueueError> {
        self.store().get(id)
    }

    /// Every record in dispatch order.
    pub fn messages(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        self.store().all()
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        self.store().count()
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn has_retry_timer(&self, id: &str) -> bool {
        self.scheduler.is_armed(id)
    }

    pub fn statistics(&self) -> Result<QueueStatistics, QueueError> {
        let mut stats = *self.totals();
        let store = self.store();
        stats.pending = store.count_by_status(QueueStatus::Pending)?;
        stats.sending = store.count_by_status(QueueStatus::Sending)?;
        stats.retrying = store.count_by_status(QueueStatus::Retrying)?;
        stats.failed = store.count_by_status(QueueStatus::Failed)?;
        Ok(stats)
    }

    fn publish(&self, change: QueueChange) {
        match self.statistics() {
            Ok(statistics) => {
                self.events.publish(QueueEvent { change, statistics });
            }
            Err(e) => warn!(error = %e, "Queue statistics unavailable, event dropped"),
        }
    }
}

fn current_status(store: &QueueStore, id: &str) -> Result<QueueStatus, QueueError> {
    store
        .get(id)?
        .map(|message| message.status)
        .ok_or_else(|| QueueError::NotFound(id.to_string()))
}
