// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Envelope Codec
//!
//! Envelope layout:
//!
//! ```text
//! [flags:1][type:1][timestamp:8][payloadLen:4][payload][signature:64?][addressing?]
//! ```
//!
//! Flags: bit 0 payload DEFLATE-compressed, bit 1 signature present, bit 2
//! addressing present, bit 7 envelope marker. A first byte without the
//! marker bit is a legacy envelope `[type][payload]`, never compressed.
//!
//! Payload bodies are `bincode`-encoded per message type.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Signature;
use crate::encryption::{PairingKeys, SealedContent};
use crate::relay::RelayMessage;

/// Envelope marker bit.
pub const FLAG_MARKER: u8 = 0x80;
/// Payload is DEFLATE-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// A 64-byte signature follows the payload.
pub const FLAG_SIGNATURE: u8 = 0x02;
/// Addressing follows the payload (and signature).
pub const FLAG_ADDRESSING: u8 = 0x04;

const HEADER_LEN: usize = 1 + 1 + 8 + 4;
const SIGNATURE_LEN: usize = 64;
/// Decompressed payloads larger than this are rejected.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty envelope")]
    Empty,

    #[error("Envelope truncated")]
    Truncated,

    #[error("Unexpected trailing bytes")]
    TrailingBytes,

    #[error("Unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Payload exceeds {0} bytes")]
    TooLarge(usize),
}

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ConnectionReady = 0x01,
    ConnectionReadyAck = 0x02,
    Identity = 0x03,
    IdentityAck = 0x04,
    ContactStatus = 0x05,
    ContactStatusAck = 0x06,
    HandshakeReject = 0x07,
    Direct = 0x10,
    DeliveryAck = 0x11,
    Relay = 0x12,
    RelayAck = 0x13,
    PairingRequest = 0x14,
    PairingConfirm = 0x15,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        Ok(match byte {
            0x01 => MessageType::ConnectionReady,
            0x02 => MessageType::ConnectionReadyAck,
            0x03 => MessageType::Identity,
            0x04 => MessageType::IdentityAck,
            0x05 => MessageType::ContactStatus,
            0x06 => MessageType::ContactStatusAck,
            0x07 => MessageType::HandshakeReject,
            0x10 => MessageType::Direct,
            0x11 => MessageType::DeliveryAck,
            0x12 => MessageType::Relay,
            0x13 => MessageType::RelayAck,
            0x14 => MessageType::PairingRequest,
            0x15 => MessageType::PairingConfirm,
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    /// Handshake types are the only ones exchanged before a session completes.
    pub fn is_handshake(self) -> bool {
        (self as u8) < 0x10
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReady {
    pub protocol_version: u8,
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReadyAck {
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub ephemeral_id: String,
    pub display_name: String,
    /// Persistent-key signature over `ephemeral_id`.
    pub contact_proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAck {
    pub ephemeral_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactStatus {
    pub is_contact: bool,
    pub persistent_key: Option<[u8; 32]>,
    pub exchange_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReject {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAck {
    pub original_message_id: String,
    pub final_recipient: String,
}

/// Message payload; one variant per message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ConnectionReady(ConnectionReady),
    ConnectionReadyAck(ConnectionReadyAck),
    Identity(Identity),
    IdentityAck(IdentityAck),
    ContactStatus(ContactStatus),
    ContactStatusAck,
    HandshakeReject(HandshakeReject),
    Direct(SealedContent),
    DeliveryAck(DeliveryAck),
    Relay(RelayMessage),
    RelayAck(RelayAck),
    /// Key disclosure from the side that entered the peer's code first.
    PairingRequest(PairingKeys),
    /// Key disclosure answering a request.
    PairingConfirm(PairingKeys),
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn from_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::ConnectionReady(_) => MessageType::ConnectionReady,
            Payload::ConnectionReadyAck(_) => MessageType::ConnectionReadyAck,
            Payload::Identity(_) => MessageType::Identity,
            Payload::IdentityAck(_) => MessageType::IdentityAck,
            Payload::ContactStatus(_) => MessageType::ContactStatus,
            Payload::ContactStatusAck => MessageType::ContactStatusAck,
            Payload::HandshakeReject(_) => MessageType::HandshakeReject,
            Payload::Direct(_) => MessageType::Direct,
            Payload::DeliveryAck(_) => MessageType::DeliveryAck,
            Payload::Relay(_) => MessageType::Relay,
            Payload::RelayAck(_) => MessageType::RelayAck,
            Payload::PairingRequest(_) => MessageType::PairingRequest,
            Payload::PairingConfirm(_) => MessageType::PairingConfirm,
        }
    }

    /// Serialized body, without the type byte.
    pub fn body_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Payload::ConnectionReady(body) => to_bincode(body),
            Payload::ConnectionReadyAck(body) => to_bincode(body),
            Payload::Identity(body) => to_bincode(body),
            Payload::IdentityAck(body) => to_bincode(body),
            Payload::ContactStatus(body) => to_bincode(body),
            Payload::ContactStatusAck => Ok(Vec::new()),
            Payload::HandshakeReject(body) => to_bincode(body),
            Payload::Direct(body) => to_bincode(body),
            Payload::DeliveryAck(body) => to_bincode(body),
            Payload::Relay(body) => to_bincode(body),
            Payload::RelayAck(body) => to_bincode(body),
            Payload::PairingRequest(body) => to_bincode(body),
            Payload::PairingConfirm(body) => to_bincode(body),
        }
    }

    /// Parses a body for the given type.
    pub fn from_body(message_type: MessageType, body: &[u8]) -> Result<Self, CodecError> {
        Ok(match message_type {
            MessageType::ConnectionReady => Payload::ConnectionReady(from_bincode(body)?),
            MessageType::ConnectionReadyAck => Payload::ConnectionReadyAck(from_bincode(body)?),
            MessageType::Identity => Payload::Identity(from_bincode(body)?),
            MessageType::IdentityAck => Payload::IdentityAck(from_bincode(body)?),
            MessageType::ContactStatus => Payload::ContactStatus(from_bincode(body)?),
            MessageType::ContactStatusAck => {
                if !body.is_empty() {
                    return Err(CodecError::TrailingBytes);
                }
                Payload::ContactStatusAck
            }
            MessageType::HandshakeReject => Payload::HandshakeReject(from_bincode(body)?),
            MessageType::Direct => Payload::Direct(from_bincode(body)?),
            MessageType::DeliveryAck => Payload::DeliveryAck(from_bincode(body)?),
            MessageType::Relay => Payload::Relay(from_bincode(body)?),
            MessageType::RelayAck => Payload::RelayAck(from_bincode(body)?),
            MessageType::PairingRequest => Payload::PairingRequest(from_bincode(body)?),
            MessageType::PairingConfirm => Payload::PairingConfirm(from_bincode(body)?),
        })
    }

    /// Bytes covered by an envelope signature: type byte then body.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = vec![self.message_type() as u8];
        bytes.extend_from_slice(&self.body_bytes()?);
        Ok(bytes)
    }
}

/// Sender and recipient ids for a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub sender_id: String,
    pub recipient_id: String,
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub payload: Payload,
    /// Milliseconds since the UNIX epoch; 0 for legacy envelopes.
    pub timestamp: u64,
    pub signature: Option<Signature>,
    pub addressing: Option<Addressing>,
    /// Set by the decoder when the payload arrived compressed.
    pub compressed: bool,
}

impl ProtocolMessage {
    pub fn new(payload: Payload, timestamp: u64) -> Self {
        ProtocolMessage {
            payload,
            timestamp,
            signature: None,
            addressing: None,
            compressed: false,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_addressing(mut self, addressing: Addressing) -> Self {
        self.addressing = Some(addressing);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Envelope encoder/decoder.
#[derive(Debug, Clone)]
pub struct Codec {
    compression_threshold: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(256)
    }
}

impl Codec {
    pub fn new(compression_threshold: usize) -> Self {
        Codec {
            compression_threshold,
        }
    }

    /// Encodes a message into a marked envelope.
    pub fn encode(&self, message: &ProtocolMessage) -> Result<Vec<u8>, CodecError> {
        let body = message.payload.body_bytes()?;
        let mut flags = FLAG_MARKER;

        let payload = if body.len() > self.compression_threshold {
            let deflated = deflate(&body)?;
            if deflated.len() < body.len() {
                flags |= FLAG_COMPRESSED;
                deflated
            } else {
                body
            }
        } else {
            body
        };

        let addressing = message.addressing.as_ref().map(to_bincode).transpose()?;
        if message.signature.is_some() {
            flags |= FLAG_SIGNATURE;
        }
        if addressing.is_some() {
            flags |= FLAG_ADDRESSING;
        }

        let payload_len = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge(payload.len()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + SIGNATURE_LEN);
        out.push(flags);
        out.push(message.message_type() as u8);
        out.extend_from_slice(&message.timestamp.to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&payload);
        if let Some(signature) = &message.signature {
            out.extend_from_slice(signature.as_bytes());
        }
        if let Some(addressing) = addressing {
            out.extend_from_slice(&addressing);
        }
        Ok(out)
    }

    /// Encodes a legacy `[type][payload]` envelope.
    pub fn encode_legacy(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![payload.message_type() as u8];
        out.extend_from_slice(&payload.body_bytes()?);
        Ok(out)
    }

    /// Decodes a marked or legacy envelope.
    pub fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, CodecError> {
        let (&first, rest) = bytes.split_first().ok_or(CodecError::Empty)?;

        if first & FLAG_MARKER == 0 {
            let message_type = MessageType::from_byte(first)?;
            return Ok(ProtocolMessage::new(Payload::from_body(message_type, rest)?, 0));
        }

        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated);
        }
        let flags = first;
        let message_type = MessageType::from_byte(bytes[1])?;
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[2..10]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[10..14]);
        let payload_len = u32::from_be_bytes(len) as usize;

        let payload_end = HEADER_LEN
            .checked_add(payload_len)
            .filter(|end| *end <= bytes.len())
            .ok_or(CodecError::Truncated)?;
        let raw_payload = &bytes[HEADER_LEN..payload_end];
        let mut tail = &bytes[payload_end..];

        let signature = if flags & FLAG_SIGNATURE != 0 {
            if tail.len() < SIGNATURE_LEN {
                return Err(CodecError::Truncated);
            }
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&tail[..SIGNATURE_LEN]);
            tail = &tail[SIGNATURE_LEN..];
            Some(Signature::from_bytes(sig))
        } else {
            None
        };

        let addressing = if flags & FLAG_ADDRESSING != 0 {
            Some(from_bincode::<Addressing>(tail)?)
        } else if !tail.is_empty() {
            return Err(CodecError::TrailingBytes);
        } else {
            None
        };

        let compressed = flags & FLAG_COMPRESSED != 0;
        let payload = if compressed {
            Payload::from_body(message_type, &inflate(raw_payload)?)?
        } else {
            Payload::from_body(message_type, raw_payload)?
        };

        Ok(ProtocolMessage {
            payload,
            timestamp: u64::from_be_bytes(timestamp),
            signature,
            addressing,
            compressed,
        })
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_PAYLOAD_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    if out.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge(MAX_PAYLOAD_SIZE));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery_ack(id: &str) -> Payload {
        Payload::DeliveryAck(DeliveryAck {
            message_id: id.to_string(),
        })
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let codec = Codec::new(256);
        let bytes = codec.encode(&ProtocolMessage::new(delivery_ack("m1"), 42)).unwrap();
        assert_eq!(bytes[0], FLAG_MARKER);
        assert!(!codec.decode(&bytes).unwrap().compressed);
    }

    #[test]
    fn test_repetitive_payload_compressed() {
        let codec = Codec::new(256);
        let payload = Payload::HandshakeReject(HandshakeReject {
            reason: "a".repeat(2_000),
        });
        let bytes = codec.encode(&ProtocolMessage::new(payload.clone(), 7)).unwrap();
        assert_ne!(bytes[0] & FLAG_COMPRESSED, 0);
        assert!(bytes.len() < 2_000);

        let decoded = codec.decode(&bytes).unwrap();
        assert!(decoded.compressed);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            Codec::default().decode(&[FLAG_MARKER, 0x11, 0, 0]),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Codec::default().decode(&[0x7f]),
            Err(CodecError::UnknownType(0x7f))
        );
    }

    #[test]
    fn test_handshake_types() {
        assert!(MessageType::Identity.is_handshake());
        assert!(MessageType::HandshakeReject.is_handshake());
        assert!(!MessageType::Direct.is_handshake());
        assert!(!MessageType::RelayAck.is_handshake());
        assert!(!MessageType::PairingRequest.is_handshake());
        assert_eq!(
            MessageType::from_byte(0x15).unwrap(),
            MessageType::PairingConfirm
        );
    }
}
