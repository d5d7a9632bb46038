// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message-level transport over a chunked link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::codec::{Codec, ProtocolMessage};
use super::fragment::{fragment, MessageChunk, Reassembler};
use super::{Transport, TransportError, TransportResult};
use crate::config::TransportConfig;

struct LinkState {
    mtu: usize,
    reassembler: Reassembler,
    write_lock: Arc<Mutex<()>>,
}

/// Sends and receives whole [`ProtocolMessage`]s over a [`Transport`].
pub struct MessageTransport {
    transport: Arc<dyn Transport>,
    codec: Codec,
    config: TransportConfig,
    links: Mutex<HashMap<String, LinkState>>,
}

impl MessageTransport {
    pub fn new(transport: Arc<dyn Transport>, config: TransportConfig) -> Self {
        MessageTransport {
            transport,
            codec: Codec::new(config.compression_threshold),
            config,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying physical transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, LinkState>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_link_state(&self, mtu: usize) -> LinkState {
        LinkState {
            mtu,
            reassembler: Reassembler::new(
                self.config.reassembly_timeout_ms,
                self.config.max_partial_messages,
            ),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Records the negotiated MTU for a link.
    pub fn register_link(&self, link_id: &str, mtu: usize) {
        let mut links = self.links();
        match links.get_mut(link_id) {
            Some(state) => state.mtu = mtu,
            None => {
                let state = self.new_link_state(mtu);
                links.insert(link_id.to_string(), state);
            }
        }
    }

    fn link_params(&self, link_id: &str) -> (usize, Arc<Mutex<()>>) {
        let mut links = self.links();
        if !links.contains_key(link_id) {
            let mtu = self
                .transport
                .mtu(link_id)
                .unwrap_or(self.config.default_mtu);
            let state = self.new_link_state(mtu);
            links.insert(link_id.to_string(), state);
        }
        match links.get(link_id) {
            Some(state) => (state.mtu, state.write_lock.clone()),
            None => (self.config.default_mtu, Arc::new(Mutex::new(()))),
        }
    }

    /// Encodes, fragments and writes a message. Returns the chunk count.
    ///
    /// Writes to one link never interleave. A failed chunk write abandons
    /// the rest of the message.
    pub fn send(&self, link_id: &str, message: &ProtocolMessage) -> TransportResult<usize> {
        let encoded = self.codec.encode(message)?;
        let (mtu, write_lock) = self.link_params(link_id);
        let chunks = fragment(&encoded, mtu, rand::random::<u32>())?;

        let _guard = write_lock.lock().unwrap_or_else(|e| e.into_inner());
        for chunk in &chunks {
            if let Err(e) = self.transport.write(link_id, &chunk.to_bytes()) {
                warn!(
                    link = %link_id,
                    message_type = ?message.message_type(),
                    index = chunk.sequence_index,
                    total = chunk.total_chunks,
                    error = %e,
                    "Chunk write failed, abandoning message"
                );
                return Err(match e {
                    TransportError::WriteFailed { .. } | TransportError::NotConnected(_) => e,
                    other => TransportError::WriteFailed {
                        peer: link_id.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        }

        debug!(
            link = %link_id,
            message_type = ?message.message_type(),
            bytes = encoded.len(),
            chunks = chunks.len(),
            "Message sent"
        );
        Ok(chunks.len())
    }

    /// Feeds one inbound chunk. Returns the decoded message once complete.
    pub fn receive(
        &self,
        link_id: &str,
        bytes: &[u8],
        now_ms: u64,
    ) -> TransportResult<Option<ProtocolMessage>> {
        let chunk = MessageChunk::from_bytes(bytes)?;

        let complete = {
            let mut links = self.links();
            if !links.contains_key(link_id) {
                let state = self.new_link_state(self.config.default_mtu);
                links.insert(link_id.to_string(), state);
            }
            match links.get_mut(link_id) {
                Some(state) => state.reassembler.accept(chunk, now_ms)?,
                None => None,
            }
        };

        match complete {
            Some(encoded) => Ok(Some(self.codec.decode(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Drops reassembly state and write serialization for a link.
    ///
    /// Returns the number of partial messages discarded.
    pub fn cancel_link(&self, link_id: &str) -> usize {
        self.links()
            .remove(link_id)
            .map(|state| state.reassembler.pending())
            .unwrap_or(0)
    }

    /// Prunes idle partial messages on every link.
    pub fn prune(&self, now_ms: u64) -> usize {
        self.links()
            .values_mut()
            .map(|state| state.reassembler.prune(now_ms))
            .sum()
    }

    /// Incomplete messages held for a link.
    pub fn pending_partials(&self, link_id: &str) -> usize {
        self.links()
            .get(link_id)
            .map(|state| state.reassembler.pending())
            .unwrap_or(0)
    }
}
