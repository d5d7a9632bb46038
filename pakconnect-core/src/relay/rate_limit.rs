// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate Limiting
//!
//! Token bucket per original sender, so one chatty node cannot flood the
//! relay queue. Time is passed in explicitly.

use std::collections::HashMap;

/// Token bucket for a single sender.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per millisecond.
    refill_rate: f64,
    last_update: u64,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64, now_ms: u64) -> Self {
        TokenBucket {
            tokens: max_tokens as f64,
            max_tokens: max_tokens as f64,
            refill_rate,
            last_update: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_update) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_update = self.last_update.max(now_ms);
    }

    fn try_consume(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        self.tokens >= self.max_tokens
    }
}

/// Rate limiter keyed by sender id.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<String, TokenBucket>,
    max_per_minute: u32,
}

impl RateLimiter {
    /// `max_per_minute` relays are allowed per sender per minute.
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            buckets: HashMap::new(),
            max_per_minute,
        }
    }

    /// Tries to consume a token for this sender.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&mut self, sender_id: &str, now_ms: u64) -> bool {
        let max = self.max_per_minute;
        self.buckets
            .entry(sender_id.to_string())
            .or_insert_with(|| TokenBucket::new(max, max as f64 / 60_000.0, now_ms))
            .try_consume(now_ms)
    }

    /// Forgets senders whose bucket has refilled completely.
    pub fn cleanup(&mut self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full(now_ms));
        before - self.buckets.len()
    }

    pub fn tracked_senders(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_after_burst() {
        let mut limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.consume("sender", 0));
        }
        assert!(!limiter.consume("sender", 0));
        // Other senders have their own bucket
        assert!(limiter.consume("other", 0));
    }

    #[test]
    fn test_refills_over_time() {
        let mut limiter = RateLimiter::new(60);
        for _ in 0..60 {
            assert!(limiter.consume("sender", 0));
        }
        assert!(!limiter.consume("sender", 500));
        // Roughly one token per second at 60/min
        assert!(limiter.consume("sender", 1_100));
    }

    #[test]
    fn test_cleanup_removes_idle_senders() {
        let mut limiter = RateLimiter::new(10);
        limiter.consume("sender", 0);
        assert_eq!(limiter.cleanup(1_000), 0);
        assert_eq!(limiter.cleanup(60_000), 1);
        assert_eq!(limiter.tracked_senders(), 0);
    }
}
