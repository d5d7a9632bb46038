// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event System
//!
//! Typed subscription channels for phase changes, relay decisions and queue
//! activity. A channel is split into a [`Publisher`] held by the producing
//! component and a [`Subscribers`] handle that hands out [`Subscription`]s.
//! Events reach every live subscription in publish order; dropping a
//! subscription unsubscribes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type Registry<E> = Mutex<Vec<(u64, UnboundedSender<E>)>>;

fn lock<E>(registry: &Registry<E>) -> MutexGuard<'_, Vec<(u64, UnboundedSender<E>)>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates a new event channel.
pub fn event_channel<E: Clone>() -> (Publisher<E>, Subscribers<E>) {
    let registry = Arc::new(Mutex::new(Vec::new()));
    let next_id = Arc::new(AtomicU64::new(0));
    (
        Publisher {
            registry: registry.clone(),
        },
        Subscribers { registry, next_id },
    )
}

/// Producing half of an event channel.
pub struct Publisher<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Publisher {
            registry: self.registry.clone(),
        }
    }
}

impl<E: Clone> Publisher<E> {
    /// Delivers an event to every live subscription.
    ///
    /// Returns the number of subscriptions the event reached.
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = lock(&self.registry);
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

/// Hands out subscriptions to an event channel.
pub struct Subscribers<E> {
    registry: Arc<Registry<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Subscribers {
            registry: self.registry.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Subscribers<E> {
    /// Registers a new subscription. Only events published afterwards are seen.
    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry).push((id, tx));
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }
}

/// Consuming half of an event channel.
pub struct Subscription<E> {
    id: u64,
    rx: UnboundedReceiver<E>,
    registry: Weak<Registry<E>>,
}

impl<E> Subscription<E> {
    /// Waits for the next event.
    ///
    /// Returns `None` once the publisher side is gone and the backlog is empty.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Drains every buffered event.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Explicitly unsubscribes. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (publisher, subscribers) = event_channel::<u32>();
        let mut sub = subscribers.subscribe();

        for i in 0..5 {
            publisher.publish(i);
        }

        assert_eq!(sub.drain(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (publisher, subscribers) = event_channel::<u32>();
        let sub = subscribers.subscribe();
        let _other = subscribers.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        drop(sub);
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(publisher.publish(1), 1);
    }

    #[test]
    fn test_late_subscriber_sees_only_new_events() {
        let (publisher, subscribers) = event_channel::<&'static str>();
        publisher.publish("early");
        let mut sub = subscribers.subscribe();
        publisher.publish("late");
        assert_eq!(sub.drain(), vec!["late"]);
    }
}
