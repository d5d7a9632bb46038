// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fragmentation and Reassembly
//!
//! Chunk layout: `message_id (u32) | index (u16) | total (u16) | data`, big
//! endian. Every chunk, header included, fits in the unit size.

use std::collections::HashMap;

use tracing::debug;

use super::TransportError;

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// One fragment of an encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChunk {
    pub message_id: u32,
    pub sequence_index: u16,
    pub total_chunks: u16,
    pub bytes: Vec<u8>,
}

impl MessageChunk {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + self.bytes.len());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.sequence_index.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(TransportError::InvalidChunk(format!(
                "{} bytes is shorter than the chunk header",
                data.len()
            )));
        }
        let chunk = MessageChunk {
            message_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            sequence_index: u16::from_be_bytes([data[4], data[5]]),
            total_chunks: u16::from_be_bytes([data[6], data[7]]),
            bytes: data[CHUNK_HEADER_SIZE..].to_vec(),
        };
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.total_chunks == 0 || self.sequence_index >= self.total_chunks {
            return Err(TransportError::InvalidChunk(format!(
                "index {} out of range for total {} (message {})",
                self.sequence_index, self.total_chunks, self.message_id
            )));
        }
        Ok(())
    }
}

/// Splits `payload` into chunks no larger than `unit_size` bytes each.
///
/// An empty payload still yields one (empty) chunk so it can be reassembled.
pub fn fragment(
    payload: &[u8],
    unit_size: usize,
    message_id: u32,
) -> Result<Vec<MessageChunk>, TransportError> {
    if unit_size <= CHUNK_HEADER_SIZE {
        return Err(TransportError::UnitTooSmall(unit_size));
    }
    let data_size = unit_size - CHUNK_HEADER_SIZE;
    let count = payload.len().div_ceil(data_size).max(1);
    let total = u16::try_from(count).map_err(|_| TransportError::PayloadTooLarge(count))?;

    if payload.is_empty() {
        return Ok(vec![MessageChunk {
            message_id,
            sequence_index: 0,
            total_chunks: 1,
            bytes: Vec::new(),
        }]);
    }

    Ok(payload
        .chunks(data_size)
        .enumerate()
        .map(|(index, bytes)| MessageChunk {
            message_id,
            sequence_index: index as u16,
            total_chunks: total,
            bytes: bytes.to_vec(),
        })
        .collect())
}

struct PartialMessage {
    total: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: u64,
    last_activity: u64,
}

/// Reassembles chunks from one peer.
pub struct Reassembler {
    partials: HashMap<u32, PartialMessage>,
    timeout_ms: u64,
    max_partial: usize,
}

impl Reassembler {
    pub fn new(timeout_ms: u64, max_partial: usize) -> Self {
        Reassembler {
            partials: HashMap::new(),
            timeout_ms,
            max_partial: max_partial.max(1),
        }
    }

    /// Accepts one chunk. Returns the full payload once every index arrived.
    ///
    /// Chunks may arrive in any order; a repeated index overwrites the
    /// earlier copy.
    pub fn accept(
        &mut self,
        chunk: MessageChunk,
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        chunk.validate()?;

        if let Some(existing) = self.partials.get(&chunk.message_id) {
            if existing.total != chunk.total_chunks {
                return Err(TransportError::InvalidChunk(format!(
                    "message {} announced {} chunks, now {}",
                    chunk.message_id, existing.total, chunk.total_chunks
                )));
            }
        } else if self.partials.len() >= self.max_partial {
            self.evict_oldest();
        }

        let partial = self
            .partials
            .entry(chunk.message_id)
            .or_insert_with(|| PartialMessage {
                total: chunk.total_chunks,
                chunks: vec![None; chunk.total_chunks as usize],
                received: 0,
                started_at: now_ms,
                last_activity: now_ms,
            });

        let slot = &mut partial.chunks[chunk.sequence_index as usize];
        if slot.is_none() {
            partial.received += 1;
        }
        *slot = Some(chunk.bytes);
        partial.last_activity = now_ms;

        if partial.received < partial.total as usize {
            return Ok(None);
        }

        let Some(complete) = self.partials.remove(&chunk.message_id) else {
            return Ok(None);
        };
        Ok(Some(complete.chunks.into_iter().flatten().flatten().collect()))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.started_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            debug!(message_id = id, "Evicting oldest partial message");
            self.partials.remove(&id);
        }
    }

    /// Drops partial sets idle for longer than the timeout.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.partials.len();
        let timeout = self.timeout_ms;
        self.partials
            .retain(|_, partial| now_ms.saturating_sub(partial.last_activity) < timeout);
        before - self.partials.len()
    }

    /// Number of incomplete messages held.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
