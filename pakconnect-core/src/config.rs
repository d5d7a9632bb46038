// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Node Configuration
//!
//! Every component reads its tunables from one section of [`NodeConfig`].
//! Durations are stored as integer milliseconds so the config serializes
//! cleanly; use the `Duration` accessors in code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Handshake tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline for each handshake phase in milliseconds.
    pub phase_timeout_ms: u64,
    /// Protocol version announced in the ready phase.
    pub protocol_version: u8,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            phase_timeout_ms: 10_000,
            protocol_version: 1,
        }
    }
}

impl HandshakeConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn with_phase_timeout_ms(mut self, ms: u64) -> Self {
        self.phase_timeout_ms = ms;
        self
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }
}

/// Fragmentation, reassembly and codec tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unit size used when the link does not report an MTU.
    pub default_mtu: usize,
    /// Idle time after which a partial chunk set is discarded.
    pub reassembly_timeout_ms: u64,
    /// Maximum partial chunk sets kept per peer.
    pub max_partial_messages: usize,
    /// Payloads larger than this are DEFLATE-compressed when it helps.
    pub compression_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            default_mtu: 185,
            reassembly_timeout_ms: 30_000,
            max_partial_messages: 32,
            compression_threshold: 256,
        }
    }
}

impl TransportConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn with_default_mtu(mut self, mtu: usize) -> Self {
        self.default_mtu = mtu;
        self
    }

    pub fn with_reassembly_timeout_ms(mut self, ms: u64) -> Self {
        self.reassembly_timeout_ms = ms;
        self
    }

    pub fn with_max_partial_messages(mut self, max: usize) -> Self {
        self.max_partial_messages = max;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }
}

/// Relay engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relays arriving with this many hops are dropped.
    pub max_hops: u8,
    /// Time to wait for a relay ACK before retransmitting.
    pub ack_timeout_ms: u64,
    /// Transmissions per forward entry before it is dropped.
    pub max_forward_attempts: u32,
    /// Relays accepted per original sender per minute.
    pub rate_limit_per_minute: u32,
    /// Message ids remembered for duplicate suppression.
    pub seen_capacity: usize,
    /// Period of the drain worker that sends due forwards and retries.
    pub drain_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            max_hops: 5,
            ack_timeout_ms: 10_000,
            max_forward_attempts: 3,
            rate_limit_per_minute: 30,
            seen_capacity: 1024,
            drain_interval_ms: 1_000,
        }
    }
}

impl RelayConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn with_max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_max_forward_attempts(mut self, attempts: u32) -> Self {
        self.max_forward_attempts = attempts;
        self
    }

    pub fn with_rate_limit_per_minute(mut self, limit: u32) -> Self {
        self.rate_limit_per_minute = limit;
        self
    }

    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen_capacity = capacity;
        self
    }

    pub fn with_drain_interval_ms(mut self, ms: u64) -> Self {
        self.drain_interval_ms = ms;
        self
    }
}

/// Offline queue tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts tolerated before a message is marked failed.
    pub max_retries: u32,
    /// First retry delay; doubles on every attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    pub backoff_cap_ms: u64,
    /// Active messages allowed per normal recipient.
    pub per_recipient_limit: usize,
    /// Active messages allowed per favorite recipient.
    pub favorite_limit: usize,
    /// Raise favorite recipients' messages by one priority tier.
    pub favorite_boost: bool,
    /// Lifetime of a queued message.
    pub default_ttl_ms: u64,
    /// A direct send with no delivery ACK after this long counts as failed.
    pub direct_ack_timeout_ms: u64,
    /// Byte budget per dispatch window for the bandwidth allocator.
    pub bandwidth_window_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 3_600_000,
            per_recipient_limit: 100,
            favorite_limit: 500,
            favorite_boost: true,
            default_ttl_ms: 7 * 24 * 60 * 60 * 1_000,
            direct_ack_timeout_ms: 15_000,
            bandwidth_window_bytes: 16 * 1024,
        }
    }
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn direct_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_ack_timeout_ms)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff_ms(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    pub fn with_limits(mut self, per_recipient: usize, favorite: usize) -> Self {
        self.per_recipient_limit = per_recipient;
        self.favorite_limit = favorite;
        self
    }

    pub fn with_favorite_boost(mut self, enabled: bool) -> Self {
        self.favorite_boost = enabled;
        self
    }

    pub fn with_default_ttl_ms(mut self, ms: u64) -> Self {
        self.default_ttl_ms = ms;
        self
    }

    pub fn with_direct_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.direct_ack_timeout_ms = ms;
        self
    }

    pub fn with_bandwidth_window_bytes(mut self, bytes: usize) -> Self {
        self.bandwidth_window_bytes = bytes;
        self
    }
}

/// Encryption layer tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Network-wide secret the global tier key is derived from.
    pub global_secret: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            global_secret: "pakconnect-mesh-v1".to_string(),
        }
    }
}

impl EncryptionConfig {
    pub fn with_global_secret(mut self, secret: impl Into<String>) -> Self {
        self.global_secret = secret.into();
        self
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub handshake: HandshakeConfig,
    pub transport: TransportConfig,
    pub relay: RelayConfig,
    pub queue: QueueConfig,
    pub encryption: EncryptionConfig,
}

impl NodeConfig {
    /// Parses a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the config as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }
}
