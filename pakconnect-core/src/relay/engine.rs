// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay decision engine and forward queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::rate_limit::RateLimiter;
use super::strategy::{DiscoveryOrder, NextHopCandidate, NextHopStrategy};
use super::{
    AckOutcome, BlockReason, DropReason, OutboundRelay, RelayDecision, RelayError, RelayEvent,
    RelayMessage, RelayQueueEntry, RelayStatistics,
};
use crate::config::RelayConfig;
use crate::events::Publisher;

/// Bounded set of recently seen message ids.
struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        SeenSet {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Inserts an id. Returns false if it was already present, plus any id
    /// evicted to make room.
    fn insert(&mut self, id: &str) -> (bool, Option<String>) {
        if self.ids.contains(id) {
            return (false, None);
        }
        let evicted = if self.order.len() >= self.capacity {
            let old = self.order.pop_front();
            if let Some(old) = &old {
                self.ids.remove(old);
            }
            old
        } else {
            None
        };
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        (true, evicted)
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }
}

struct EngineState {
    entries: Vec<RelayQueueEntry>,
    seen: SeenSet,
    /// Message id -> neighbour we received it from.
    reverse_path: HashMap<String, String>,
    originated: HashSet<String>,
    /// Ids known to have reached their final recipient.
    acknowledged: HashSet<String>,
    blocked_senders: HashSet<String>,
    rate_limiter: RateLimiter,
    stats: RelayStatistics,
}

impl EngineState {
    fn mark_seen(&mut self, id: &str) -> bool {
        let (inserted, evicted) = self.seen.insert(id);
        if let Some(old) = evicted {
            self.reverse_path.remove(&old);
            self.acknowledged.remove(&old);
        }
        inserted
    }

    fn snapshot(&mut self) -> RelayStatistics {
        self.stats.queued = self.entries.len();
        self.stats
    }
}

/// Decides what happens to relays and owns the forward queue.
pub struct MeshRelayEngine {
    node_id: String,
    aliases: Vec<String>,
    config: RelayConfig,
    strategy: Box<dyn NextHopStrategy>,
    state: Mutex<EngineState>,
    events: Publisher<RelayEvent>,
}

impl MeshRelayEngine {
    /// Creates an engine for `node_id` (this node's routing id).
    pub fn new(node_id: &str, config: RelayConfig, events: Publisher<RelayEvent>) -> Self {
        let state = EngineState {
            entries: Vec::new(),
            seen: SeenSet::new(config.seen_capacity),
            reverse_path: HashMap::new(),
            originated: HashSet::new(),
            acknowledged: HashSet::new(),
            blocked_senders: HashSet::new(),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute),
            stats: RelayStatistics::default(),
        };
        MeshRelayEngine {
            node_id: node_id.to_string(),
            aliases: Vec::new(),
            config,
            strategy: Box::new(DiscoveryOrder),
            state: Mutex::new(state),
            events,
        }
    }

    /// Another id that names this node (its persistent id).
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn NextHopStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.node_id == id || self.aliases.iter().any(|alias| alias == id)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pick_next_hop(
        &self,
        message: &RelayMessage,
        from_node_id: Option<&str>,
        candidates: &[NextHopCandidate],
    ) -> Option<String> {
        let eligible: Vec<NextHopCandidate> = candidates
            .iter()
            .filter(|c| !self.is_local(&c.node_id))
            .filter(|c| from_node_id.map_or(true, |from| !c.is(from)))
            .filter(|c| !message.metadata.has_visited(&c.node_id))
            .cloned()
            .collect();

        if let Some(direct) = eligible
            .iter()
            .find(|c| c.is(&message.metadata.final_recipient))
        {
            return Some(direct.node_id.clone());
        }
        self.strategy.select(&eligible).map(|c| c.node_id.clone())
    }

    fn finish(
        &self,
        mut state: MutexGuard<'_, EngineState>,
        message_id: &str,
        decision: RelayDecision,
    ) -> RelayDecision {
        state.stats.record(&decision);
        let statistics = state.snapshot();
        drop(state);

        match &decision {
            RelayDecision::DeliveredToSelf => {
                debug!(message_id = %message_id, "Relay delivered to self")
            }
            RelayDecision::Relayed { next_hop } => {
                debug!(message_id = %message_id, next_hop = %next_hop, "Relay queued for forwarding")
            }
            RelayDecision::Dropped(reason) => {
                warn!(message_id = %message_id, ?reason, "Relay dropped")
            }
            RelayDecision::Blocked(reason) => {
                warn!(message_id = %message_id, ?reason, "Relay blocked")
            }
            RelayDecision::Error(error) => {
                warn!(message_id = %message_id, error = %error, "Relay rejected")
            }
        }

        self.events.publish(RelayEvent {
            message_id: message_id.to_string(),
            decision: decision.clone(),
            statistics,
        });
        decision
    }

    /// Decides what to do with a relay received from `from_node_id`.
    pub fn process_incoming_relay(
        &self,
        message: RelayMessage,
        from_node_id: &str,
        candidates: &[NextHopCandidate],
        now_ms: u64,
    ) -> RelayDecision {
        let meta = &message.metadata;
        let message_id = meta.original_message_id.clone();
        let mut state = self.state();

        if meta.original_message_id.is_empty()
            || meta.original_sender.is_empty()
            || meta.final_recipient.is_empty()
        {
            let error = RelayError::MalformedMetadata("empty id field".to_string());
            return self.finish(state, &message_id, RelayDecision::Error(error.to_string()));
        }

        if self.is_local(&meta.final_recipient) {
            let decision = if state.mark_seen(&message_id) {
                state
                    .reverse_path
                    .insert(message_id.clone(), from_node_id.to_string());
                state.acknowledged.insert(message_id.clone());
                RelayDecision::DeliveredToSelf
            } else {
                RelayDecision::Dropped(DropReason::Duplicate)
            };
            return self.finish(state, &message_id, decision);
        }

        if self.is_local(from_node_id) || meta.visited_node_ids.iter().any(|id| self.is_local(id))
        {
            return self.finish(state, &message_id, RelayDecision::Blocked(BlockReason::Loop));
        }
        if state.seen.contains(&message_id) {
            return self.finish(state, &message_id, RelayDecision::Dropped(DropReason::Duplicate));
        }
        if meta.hop_count >= self.config.max_hops {
            return self.finish(state, &message_id, RelayDecision::Dropped(DropReason::HopLimit));
        }
        if state.blocked_senders.contains(&meta.original_sender) {
            return self.finish(
                state,
                &message_id,
                RelayDecision::Blocked(BlockReason::BlockedSender),
            );
        }
        if !state.rate_limiter.consume(&meta.original_sender, now_ms) {
            return self.finish(
                state,
                &message_id,
                RelayDecision::Blocked(BlockReason::RateLimited),
            );
        }

        let Some(next_hop) = self.pick_next_hop(&message, Some(from_node_id), candidates) else {
            return self.finish(state, &message_id, RelayDecision::Dropped(DropReason::NoRoute));
        };

        state.mark_seen(&message_id);
        state
            .reverse_path
            .insert(message_id.clone(), from_node_id.to_string());
        let forwarded = RelayMessage {
            metadata: message.metadata.forwarded_by(&self.node_id),
            content: message.content,
        };
        state.entries.push(RelayQueueEntry {
            relay_message: forwarded,
            next_hop_id: next_hop.clone(),
            queued_at: now_ms,
            attempts: 0,
            last_attempt_at: None,
        });
        self.finish(state, &message_id, RelayDecision::Relayed { next_hop })
    }

    /// Queues a relay this node originates. The metadata should come from
    /// [`RelayMetadata::originate`](super::RelayMetadata::originate).
    pub fn originate(
        &self,
        message: RelayMessage,
        candidates: &[NextHopCandidate],
        now_ms: u64,
    ) -> RelayDecision {
        let message_id = message.metadata.original_message_id.clone();
        let mut state = self.state();

        let Some(next_hop) = self.pick_next_hop(&message, None, candidates) else {
            return self.finish(state, &message_id, RelayDecision::Dropped(DropReason::NoRoute));
        };

        state.mark_seen(&message_id);
        state.originated.insert(message_id.clone());
        state.stats.originated += 1;
        state.entries.retain(|e| e.relay_message.metadata.original_message_id != message_id);
        state.entries.push(RelayQueueEntry {
            relay_message: message,
            next_hop_id: next_hop.clone(),
            queued_at: now_ms,
            attempts: 0,
            last_attempt_at: None,
        });
        let statistics = state.snapshot();
        drop(state);

        info!(message_id = %message_id, next_hop = %next_hop, "Relay originated");
        let decision = RelayDecision::Relayed { next_hop };
        self.events.publish(RelayEvent {
            message_id,
            decision: decision.clone(),
            statistics,
        });
        decision
    }

    /// Returns forwards due for transmission, by priority then age.
    ///
    /// A transmitted entry waits `ack_timeout` before it is due again;
    /// entries that used up their attempts are dropped.
    pub fn next_batch(&self, now_ms: u64) -> Vec<OutboundRelay> {
        let ack_timeout = self.config.ack_timeout_ms;
        let max_attempts = self.config.max_forward_attempts;
        let mut state = self.state();

        let mut expired = Vec::new();
        state.entries.retain(|entry| {
            let waited_out = entry
                .last_attempt_at
                .is_some_and(|at| now_ms.saturating_sub(at) >= ack_timeout);
            if waited_out && entry.attempts >= max_attempts {
                expired.push(entry.relay_message.metadata.original_message_id.clone());
                false
            } else {
                true
            }
        });

        let mut due: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry
                    .last_attempt_at
                    .map_or(true, |at| now_ms.saturating_sub(at) >= ack_timeout)
            })
            .map(|(index, _)| index)
            .collect();
        due.sort_by(|a, b| {
            let ea = &state.entries[*a];
            let eb = &state.entries[*b];
            eb.relay_message
                .metadata
                .priority
                .cmp(&ea.relay_message.metadata.priority)
                .then(ea.queued_at.cmp(&eb.queued_at))
        });

        let mut batch = Vec::with_capacity(due.len());
        for index in due {
            let entry = &mut state.entries[index];
            entry.attempts += 1;
            entry.last_attempt_at = Some(now_ms);
            batch.push(OutboundRelay {
                next_hop_id: entry.next_hop_id.clone(),
                message: entry.relay_message.clone(),
            });
        }
        state.stats.transmissions += batch.len() as u64;

        let mut events = Vec::new();
        for message_id in expired {
            state.stats.dropped_ack_timeout += 1;
            // Our own messages go back to the offline queue for retry;
            // anything else may be routed afresh when upstream retransmits.
            if !state.originated.remove(&message_id) {
                state.seen.remove(&message_id);
            }
            warn!(message_id = %message_id, "Relay dropped after exhausting forward attempts");
            events.push(message_id);
        }
        let statistics = state.snapshot();
        drop(state);

        for message_id in events {
            self.events.publish(RelayEvent {
                message_id,
                decision: RelayDecision::Dropped(DropReason::AckTimeout),
                statistics,
            });
        }
        batch
    }

    /// Records that a transmission could not be written to the link. The
    /// entry stays queued and is retried after the ACK timeout.
    pub fn record_send_failure(&self, message_id: &str) {
        let mut state = self.state();
        state.stats.send_failures += 1;
        warn!(message_id = %message_id, "Relay transmission failed");
    }

    /// Handles a relay ACK received from `from_node_id`.
    pub fn on_relay_ack(&self, message_id: &str, from_node_id: &str) -> AckOutcome {
        let mut state = self.state();

        let position = state
            .entries
            .iter()
            .position(|e| e.relay_message.metadata.original_message_id == message_id);
        if let Some(index) = position {
            if state.entries[index].next_hop_id != from_node_id {
                warn!(
                    message_id = %message_id,
                    from = %from_node_id,
                    expected = %state.entries[index].next_hop_id,
                    "Relay ACK from unexpected neighbour"
                );
                return AckOutcome::Unknown;
            }
            state.entries.remove(index);
        }

        if state.originated.remove(message_id) {
            state.stats.acks_received += 1;
            state.snapshot();
            info!(message_id = %message_id, "Relay acknowledged by final recipient");
            return AckOutcome::Originator(message_id.to_string());
        }

        if position.is_some() {
            if let Some(previous_hop) = state.reverse_path.get(message_id).cloned() {
                state.acknowledged.insert(message_id.to_string());
                state.stats.acks_forwarded += 1;
                state.snapshot();
                debug!(message_id = %message_id, to = %previous_hop, "Forwarding relay ACK");
                return AckOutcome::Forward { previous_hop };
            }
        }

        debug!(message_id = %message_id, "Ignoring stale relay ACK");
        AckOutcome::Unknown
    }

    /// Returns true if `message_id` already reached its final recipient, so a
    /// duplicate should be answered with a fresh ACK instead of a forward.
    pub fn was_acknowledged(&self, message_id: &str) -> bool {
        self.state().acknowledged.contains(message_id)
    }

    /// Neighbour a relay was received from, if it is still remembered.
    pub fn previous_hop(&self, message_id: &str) -> Option<String> {
        self.state().reverse_path.get(message_id).cloned()
    }

    /// Stops relaying on behalf of `sender_id`.
    pub fn block_sender(&self, sender_id: &str) {
        self.state().blocked_senders.insert(sender_id.to_string());
    }

    pub fn unblock_sender(&self, sender_id: &str) {
        self.state().blocked_senders.remove(sender_id);
    }

    /// Forgets a message id so a later copy is processed afresh.
    pub fn forget(&self, message_id: &str) {
        let mut state = self.state();
        state.seen.remove(message_id);
        state.reverse_path.remove(message_id);
    }

    /// Releases rate-limit state for idle senders.
    pub fn cleanup(&self, now_ms: u64) -> usize {
        self.state().rate_limiter.cleanup(now_ms)
    }

    pub fn statistics(&self) -> RelayStatistics {
        self.state().snapshot()
    }

    /// Copy of the forward queue.
    pub fn queue_snapshot(&self) -> Vec<RelayQueueEntry> {
        self.state().entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        assert_eq!(seen.insert("a"), (true, None));
        assert_eq!(seen.insert("b"), (true, None));
        assert_eq!(seen.insert("a"), (false, None));
        assert_eq!(seen.insert("c"), (true, Some("a".to_string())));
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
    }

    #[test]
    fn test_exhausted_originated_relay_is_released() {
        use crate::encryption::SealedContent;
        use crate::events::event_channel;
        use crate::queue::MessagePriority;
        use crate::relay::RelayMetadata;

        let (publisher, _subscribers) = event_channel();
        let config = RelayConfig::default()
            .with_ack_timeout_ms(1_000)
            .with_max_forward_attempts(1);
        let engine = MeshRelayEngine::new("a", config, publisher);
        let message = RelayMessage {
            metadata: RelayMetadata::originate("m1", "a", "d", MessagePriority::Normal, "a"),
            content: SealedContent {
                message_id: "m1".into(),
                timestamp: 1,
                ciphertext: vec![1],
                signature: vec![0u8; 64],
            },
        };
        engine.originate(message, &[NextHopCandidate::new("b", 0)], 0);
        assert!(engine.state().originated.contains("m1"));

        assert_eq!(engine.next_batch(0).len(), 1);
        assert!(engine.next_batch(1_000).is_empty());
        assert!(engine.state().originated.is_empty());
        assert!(engine.state().seen.contains("m1"));
        assert_eq!(engine.on_relay_ack("m1", "b"), AckOutcome::Unknown);
    }

    #[test]
    fn test_seen_set_remove() {
        let mut seen = SeenSet::new(4);
        seen.insert("a");
        seen.remove("a");
        assert!(!seen.contains("a"));
        assert_eq!(seen.insert("a"), (true, None));
    }
}
