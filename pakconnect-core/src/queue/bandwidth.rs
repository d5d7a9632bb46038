// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-window byte budget split across priority tiers.

use super::{MessagePriority, QueuedMessage};

/// Allocates a dispatch window's byte budget by tier weight.
///
/// Each tier gets `budget * weight / total_weight`. Whatever a tier leaves
/// unused spills down to the next tier. Within a tier messages are taken in
/// enqueue order and selection stops at the first one that does not fit.
#[derive(Debug, Clone)]
pub struct QueueBandwidthAllocator {
    window_bytes: usize,
}

impl QueueBandwidthAllocator {
    pub fn new(window_bytes: usize) -> Self {
        QueueBandwidthAllocator { window_bytes }
    }

    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    pub fn weight(priority: MessagePriority) -> usize {
        match priority {
            MessagePriority::Urgent => 4,
            MessagePriority::High => 3,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 1,
        }
    }

    /// Picks the messages to send this window, in dispatch order.
    ///
    /// If nothing fits but candidates exist, the first candidate in dispatch
    /// order is still returned so an oversized message cannot stall the queue.
    pub fn allocate(&self, candidates: &[QueuedMessage]) -> Vec<QueuedMessage> {
        let mut ordered: Vec<&QueuedMessage> = candidates.iter().collect();
        ordered.sort_by_key(|m| m.dispatch_key());

        let total_weight: usize = MessagePriority::DESCENDING
            .iter()
            .map(|p| Self::weight(*p))
            .sum();

        let mut selected = Vec::new();
        let mut carry = 0usize;
        for tier in MessagePriority::DESCENDING {
            let share = self.window_bytes * Self::weight(tier) / total_weight;
            let mut allowance = share + carry;
            for message in ordered.iter().filter(|m| m.priority == tier) {
                let size = message.payload.len();
                if size > allowance {
                    break;
                }
                allowance -= size;
                selected.push((*message).clone());
            }
            carry = allowance;
        }

        if selected.is_empty() {
            if let Some(first) = ordered.first() {
                selected.push((*first).clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;

    fn message(seq: i64, priority: MessagePriority, size: usize) -> QueuedMessage {
        QueuedMessage {
            seq,
            id: format!("m{}", seq),
            chat_id: "chat".into(),
            recipient_id: "bob".into(),
            payload: vec![0u8; size],
            priority,
            status: QueueStatus::Pending,
            enqueued_at: 0,
            next_retry_at: None,
            attempts: 0,
            expires_at: u64::MAX,
            last_attempt_at: None,
            last_error: None,
            is_favorite: false,
        }
    }

    fn ids(selected: &[QueuedMessage]) -> Vec<&str> {
        selected.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_everything_fits() {
        let allocator = QueueBandwidthAllocator::new(10_000);
        let candidates = vec![
            message(1, MessagePriority::Low, 10),
            message(2, MessagePriority::Urgent, 10),
            message(3, MessagePriority::Normal, 10),
        ];
        assert_eq!(ids(&allocator.allocate(&candidates)), vec!["m2", "m3", "m1"]);
    }

    #[test]
    fn test_tier_shares_limit_low_priority() {
        // 1000 bytes: urgent 400, high 300, normal 200, low 100
        let allocator = QueueBandwidthAllocator::new(1_000);
        let candidates = vec![
            message(1, MessagePriority::Urgent, 300),
            message(2, MessagePriority::Low, 150),
            message(3, MessagePriority::Low, 150),
            message(4, MessagePriority::Normal, 200),
        ];
        // Urgent leaves 100, high leaves 400 in total, normal spends 200 of
        // 600, low gets 400 + 100 and takes both.
        assert_eq!(
            ids(&allocator.allocate(&candidates)),
            vec!["m1", "m4", "m2", "m3"]
        );

        let tight = QueueBandwidthAllocator::new(500);
        // Urgent 200 cannot hold m1; the unused share flows down so normal
        // has 450 for m4 and low has 300 for both low messages.
        assert_eq!(ids(&tight.allocate(&candidates)), vec!["m4", "m2", "m3"]);

        let tighter = QueueBandwidthAllocator::new(400);
        // Low gets 40 plus the 160 normal left over: m2 fits, m3 does not.
        assert_eq!(ids(&tighter.allocate(&candidates)), vec!["m4", "m2"]);
    }

    #[test]
    fn test_oversized_head_still_sent() {
        let allocator = QueueBandwidthAllocator::new(100);
        let candidates = vec![message(1, MessagePriority::High, 5_000)];
        assert_eq!(ids(&allocator.allocate(&candidates)), vec!["m1"]);
    }

    #[test]
    fn test_empty() {
        let allocator = QueueBandwidthAllocator::new(100);
        assert!(allocator.allocate(&[]).is_empty());
    }
}
