// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Offline queue: ordering, capacity, durability, attempts and retries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pakconnect_core::queue::QueueChange;
use pakconnect_core::{
    event_channel, Direction, InMemoryDirectory, InMemoryMessageStore, MessagePriority,
    OfflineMessageQueue, QueueConfig, QueueError, QueueEvent, QueueStatus, QueueStore,
    Subscription,
};
use tempfile::TempDir;

struct Fixture {
    queue: OfflineMessageQueue,
    directory: Arc<InMemoryDirectory>,
    store: Arc<InMemoryMessageStore>,
    events: Subscription<QueueEvent>,
}

fn fixture_with(store: QueueStore, config: QueueConfig, directory: Arc<InMemoryDirectory>) -> Fixture {
    let message_store = Arc::new(InMemoryMessageStore::new());
    let (publisher, subscribers) = event_channel();
    let events = subscribers.subscribe();
    let queue = OfflineMessageQueue::new(
        store,
        config,
        directory.clone(),
        message_store.clone(),
        publisher,
        0,
    )
    .unwrap();
    Fixture {
        queue,
        directory,
        store: message_store,
        events,
    }
}

fn fixture(config: QueueConfig) -> Fixture {
    fixture_with(
        QueueStore::in_memory().unwrap(),
        config,
        Arc::new(InMemoryDirectory::new()),
    )
}

#[test]
fn test_favorite_recipient_leaves_first() {
    let f = fixture(QueueConfig::default());
    f.directory.set_favorite("fav", true);

    let n1 = f.queue.enqueue("c1", "n1", b"one", MessagePriority::Normal, 0).unwrap();
    let n2 = f.queue.enqueue("c2", "n2", b"two", MessagePriority::Normal, 1).unwrap();
    let fav = f.queue.enqueue("c3", "fav", b"three", MessagePriority::Normal, 2).unwrap();

    let order: Vec<String> = f.queue.dispatchable(10).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(order, vec![fav.clone(), n1, n2]);

    let stored = f.queue.get(&fav).unwrap().unwrap();
    assert_eq!(stored.priority, MessagePriority::High);
    assert!(stored.is_favorite);
}

#[test]
fn test_favorite_boost_is_not_reevaluated_on_retry() {
    let f = fixture(QueueConfig::default().with_backoff_ms(1_000, 1_000));
    f.directory.set_favorite("bob", true);
    let boosted = f.queue.enqueue("c", "bob", b"1", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&boosted, 0).unwrap().unwrap();
    assert_eq!(
        f.queue.mark_failed_attempt(&boosted, "timeout", 0).unwrap(),
        QueueStatus::Retrying
    );

    // Bob stops being a favorite before the retry; Carol's message is newer.
    f.directory.set_favorite("bob", false);
    let later = f.queue.enqueue("c", "carol", b"2", MessagePriority::Normal, 10).unwrap();

    let order: Vec<String> = f
        .queue
        .dispatchable(1_000)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(order, vec![boosted.clone(), later]);

    let retried = f.queue.begin_attempt(&boosted, 1_000).unwrap().unwrap();
    assert_eq!(retried.priority, MessagePriority::High);
    assert!(retried.is_favorite);
    assert_eq!(retried.attempts, 2);
}

#[test]
fn test_boost_can_be_disabled() {
    let f = fixture(QueueConfig::default().with_favorite_boost(false));
    f.directory.set_favorite("fav", true);
    let id = f.queue.enqueue("c", "fav", b"x", MessagePriority::Low, 0).unwrap();
    assert_eq!(f.queue.get(&id).unwrap().unwrap().priority, MessagePriority::Low);
}

#[test]
fn test_capacity_rejects_without_eviction() {
    let mut f = fixture(QueueConfig::default().with_limits(2, 4));
    let first = f.queue.enqueue("c", "bob", b"1", MessagePriority::Low, 0).unwrap();
    f.queue.enqueue("c", "bob", b"2", MessagePriority::Low, 1).unwrap();

    let err = f
        .queue
        .enqueue("c", "bob", b"3", MessagePriority::Urgent, 2)
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::CapacityExceeded { ref recipient, limit: 2 } if recipient == "bob"
    ));
    assert_eq!(f.queue.len().unwrap(), 2);
    assert!(f.queue.get(&first).unwrap().is_some());
    assert_eq!(f.queue.statistics().unwrap().rejected_total, 1);

    // Other recipients and favorites have their own limits.
    f.queue.enqueue("c", "carol", b"4", MessagePriority::Low, 3).unwrap();
    f.directory.set_favorite("dave", true);
    for i in 0..4u8 {
        f.queue.enqueue("c", "dave", &[i], MessagePriority::Low, 4).unwrap();
    }

    // Withdrawing frees a slot.
    assert!(f.queue.withdraw(&first).unwrap());
    f.queue.enqueue("c", "bob", b"5", MessagePriority::Low, 5).unwrap();

    let enqueued = f
        .events
        .drain()
        .into_iter()
        .filter(|e| matches!(e.change, QueueChange::Enqueued { .. }))
        .count();
    assert_eq!(enqueued, 8);
}

#[test]
fn test_failed_records_do_not_hold_capacity() {
    let f = fixture(QueueConfig::default().with_limits(1, 1).with_max_retries(1));
    let id = f.queue.enqueue("c", "bob", b"1", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 0).unwrap().unwrap();
    assert_eq!(
        f.queue.mark_failed_attempt(&id, "unreachable", 0).unwrap(),
        QueueStatus::Failed
    );
    f.queue.enqueue("c", "bob", b"2", MessagePriority::Normal, 1).unwrap();
    assert_eq!(f.queue.statistics().unwrap().failed, 1);
}

#[test]
fn test_only_one_attempt_in_flight() {
    let f = fixture(QueueConfig::default());
    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();

    let claimed = f.queue.begin_attempt(&id, 5).unwrap().unwrap();
    assert_eq!(claimed.status, QueueStatus::Sending);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.last_attempt_at, Some(5));

    assert!(f.queue.begin_attempt(&id, 6).unwrap().is_none());
    assert!(f.queue.dispatchable(6).unwrap().is_empty());
    assert!(f.queue.begin_attempt("missing", 6).unwrap().is_none());
}

#[test]
fn test_backoff_then_failure() {
    let f = fixture(
        QueueConfig::default()
            .with_max_retries(3)
            .with_backoff_ms(1_000, 1_500),
    );
    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();

    f.queue.begin_attempt(&id, 0).unwrap().unwrap();
    assert_eq!(
        f.queue.mark_failed_attempt(&id, "timeout", 0).unwrap(),
        QueueStatus::Retrying
    );
    let waiting = f.queue.get(&id).unwrap().unwrap();
    assert_eq!(waiting.next_retry_at, Some(1_000));
    assert_eq!(waiting.last_error.as_deref(), Some("timeout"));
    assert!(f.queue.has_retry_timer(&id));
    assert!(f.queue.dispatchable(999).unwrap().is_empty());
    assert_eq!(f.queue.dispatchable(1_000).unwrap().len(), 1);

    f.queue.begin_attempt(&id, 1_000).unwrap().unwrap();
    assert!(!f.queue.has_retry_timer(&id));
    f.queue.mark_failed_attempt(&id, "timeout", 1_000).unwrap();
    // Second delay doubles but is capped.
    assert_eq!(f.queue.get(&id).unwrap().unwrap().next_retry_at, Some(2_500));

    f.queue.begin_attempt(&id, 2_500).unwrap().unwrap();
    assert_eq!(
        f.queue.mark_failed_attempt(&id, "timeout", 2_500).unwrap(),
        QueueStatus::Failed
    );
    assert!(f.queue.dispatchable(10_000).unwrap().is_empty());
    let stats = f.queue.statistics().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failed_total, 1);
    // Kept for the application to report until withdrawn.
    assert!(f.queue.withdraw(&id).unwrap());
    assert!(f.queue.is_empty().unwrap());
}

#[test]
fn test_failure_outside_attempt_is_ignored() {
    let f = fixture(QueueConfig::default());
    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();
    assert_eq!(
        f.queue.mark_failed_attempt(&id, "late", 0).unwrap(),
        QueueStatus::Pending
    );
    assert!(matches!(
        f.queue.mark_failed_attempt("missing", "late", 0),
        Err(QueueError::NotFound(_))
    ));
}

#[test]
fn test_unacked_attempts_are_reaped() {
    let f = fixture(QueueConfig::default().with_direct_ack_timeout_ms(100));
    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 10).unwrap().unwrap();

    assert!(f.queue.reap_unacked(50).unwrap().is_empty());
    assert_eq!(f.queue.reap_unacked(110).unwrap(), vec![id.clone()]);
    assert_eq!(f.queue.get(&id).unwrap().unwrap().status, QueueStatus::Retrying);
}

#[test]
fn test_expiry_fails_active_messages() {
    let mut f = fixture(QueueConfig::default().with_default_ttl_ms(1_000));
    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();

    assert!(f.queue.expire(999).unwrap().is_empty());
    assert_eq!(f.queue.expire(1_000).unwrap(), vec![id.clone()]);

    let record = f.queue.get(&id).unwrap().unwrap();
    assert_eq!(record.status, QueueStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("expired"));
    assert_eq!(f.queue.statistics().unwrap().expired_total, 1);
    assert!(f.events.drain().iter().any(|e| e.change
        == QueueChange::Failed {
            message_id: id.clone(),
            reason: "expired".into()
        }));
}

#[test]
fn test_delivery_hands_off_and_removes() {
    let f = fixture(QueueConfig::default());
    let id = f.queue.enqueue("chat-1", "bob", b"hello", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 1).unwrap().unwrap();

    assert!(f.queue.mark_delivered(&id, 7).unwrap());
    assert!(f.queue.is_empty().unwrap());
    assert!(!f.queue.mark_delivered(&id, 8).unwrap());

    let delivered = f.store.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message_id, id);
    assert_eq!(delivered[0].chat_id, "chat-1");
    assert_eq!(delivered[0].peer_id, "bob");
    assert_eq!(delivered[0].content, b"hello");
    assert_eq!(delivered[0].timestamp, 7);
    assert_eq!(delivered[0].direction, Direction::Outbound);
    assert_eq!(f.queue.statistics().unwrap().delivered_total, 1);
}

#[test]
fn test_rejected_hand_off_keeps_record() {
    let f = fixture(QueueConfig::default());
    let id = f.queue.enqueue("c", "bob", b"hello", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 1).unwrap().unwrap();

    f.store.fail_next(1);
    assert!(matches!(
        f.queue.mark_delivered(&id, 2),
        Err(QueueError::Delivery(_))
    ));
    assert!(f.queue.get(&id).unwrap().is_some());
    assert!(f.store.is_empty());

    assert!(f.queue.mark_delivered(&id, 3).unwrap());
    assert_eq!(f.store.len(), 1);
}

#[test]
fn test_survives_restart_mid_attempt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let directory = Arc::new(InMemoryDirectory::new());

    let (sending, waiting) = {
        let f = fixture_with(
            QueueStore::open(&path).unwrap(),
            QueueConfig::default(),
            directory.clone(),
        );
        let sending = f.queue.enqueue("c", "bob", b"a", MessagePriority::High, 0).unwrap();
        let waiting = f.queue.enqueue("c", "bob", b"b", MessagePriority::Normal, 1).unwrap();
        f.queue.begin_attempt(&sending, 2).unwrap().unwrap();
        (sending, waiting)
    };

    let f = fixture_with(QueueStore::open(&path).unwrap(), QueueConfig::default(), directory);
    assert_eq!(f.queue.len().unwrap(), 2);

    let recovered = f.queue.get(&sending).unwrap().unwrap();
    assert_eq!(recovered.status, QueueStatus::Retrying);
    assert_eq!(recovered.attempts, 1);
    assert_eq!(recovered.payload, b"a");

    let order: Vec<String> = f.queue.dispatchable(3).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(order, vec![sending, waiting]);
}

#[test]
fn test_bandwidth_window_caps_batch() {
    let f = fixture(QueueConfig::default().with_bandwidth_window_bytes(1_000));
    for i in 0..5u8 {
        f.queue
            .enqueue("c", "bob", &[i; 300], MessagePriority::Normal, i as u64)
            .unwrap();
    }
    let batch = f.queue.dispatchable_within(10, |_| true).unwrap();
    assert!(!batch.is_empty());
    assert!(batch.len() < 5);
    assert!(batch.iter().map(|m| m.payload.len()).sum::<usize>() <= 1_000);

    assert!(f
        .queue
        .dispatchable_within(10, |m| m.recipient_id == "carol")
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_timer_fires_once_due() {
    let f = fixture(QueueConfig::default().with_backoff_ms(1_000, 60_000));
    let mut fired_rx = f.queue.take_retry_receiver().unwrap();
    assert!(f.queue.take_retry_receiver().is_none());

    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 0).unwrap().unwrap();
    f.queue.mark_failed_attempt(&id, "timeout", 0).unwrap();

    let fired = fired_rx.recv().await.unwrap();
    assert_eq!(fired.message_id, id);
    let due = f.queue.on_retry_fired(&fired, 1_000).unwrap().unwrap();
    assert_eq!(due.id, id);
    // The same timer cannot fire twice.
    assert!(f.queue.on_retry_fired(&fired, 1_000).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_withdraw_cancels_retry_timer() {
    let f = fixture(QueueConfig::default().with_backoff_ms(1_000, 60_000));
    let mut fired_rx = f.queue.take_retry_receiver().unwrap();

    let id = f.queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, 0).unwrap();
    f.queue.begin_attempt(&id, 0).unwrap().unwrap();
    f.queue.mark_failed_attempt(&id, "timeout", 0).unwrap();
    assert!(f.queue.withdraw(&id).unwrap());
    assert!(!f.queue.has_retry_timer(&id));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fired_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_racing_withdrawal_leaves_no_timer() {
    let queue = Arc::new(fixture(QueueConfig::default().with_backoff_ms(60_000, 60_000)).queue);

    for round in 0..100u64 {
        let id = queue.enqueue("c", "bob", b"hi", MessagePriority::Normal, round).unwrap();
        queue.begin_attempt(&id, round).unwrap().unwrap();

        let (failing, withdrawing) = (queue.clone(), queue.clone());
        let (fail_id, withdraw_id) = (id.clone(), id.clone());
        let fail = tokio::task::spawn_blocking(move || {
            // NotFound when the withdrawal got there first.
            let _ = failing.mark_failed_attempt(&fail_id, "timeout", round);
        });
        let withdraw = tokio::task::spawn_blocking(move || withdrawing.withdraw(&withdraw_id));
        fail.await.unwrap();
        assert!(withdraw.await.unwrap().unwrap());

        assert!(queue.get(&id).unwrap().is_none());
        assert!(!queue.has_retry_timer(&id), "timer left armed in round {}", round);
    }
}
