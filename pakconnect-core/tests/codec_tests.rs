// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire envelope encoding.

mod common;

use pakconnect_core::transport::{
    Addressing, CodecError, Identity, MessageType, Payload, RelayAck, FLAG_ADDRESSING,
    FLAG_COMPRESSED, FLAG_MARKER, FLAG_SIGNATURE,
};
use pakconnect_core::{
    Codec, MessagePriority, ProtocolMessage, RelayMessage, RelayMetadata, SealedContent,
};

fn relay_message(ciphertext: Vec<u8>) -> RelayMessage {
    RelayMessage {
        metadata: RelayMetadata::originate("m1", "sender", "recipient", MessagePriority::High, "a"),
        content: SealedContent {
            message_id: "m1".into(),
            timestamp: 99,
            ciphertext,
            signature: vec![3u8; 64],
        },
    }
}

#[test]
fn test_signed_identity_keeps_signature() {
    let identity = common::identity("alice", 1);
    let payload = Payload::Identity(Identity {
        ephemeral_id: identity.ephemeral_id(),
        display_name: "alice".into(),
        contact_proof: identity.contact_proof().as_bytes().to_vec(),
    });
    let signature = identity.sign_ephemeral(&payload.signing_bytes().unwrap());
    let message = ProtocolMessage::new(payload, 1_700_000_000_000).with_signature(signature);

    let codec = Codec::default();
    let bytes = codec.encode(&message).unwrap();
    assert_eq!(bytes[0], FLAG_MARKER | FLAG_SIGNATURE);
    assert_eq!(bytes[1], MessageType::Identity as u8);

    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn test_addressing_trails_the_envelope() {
    let message = ProtocolMessage::new(
        Payload::RelayAck(RelayAck {
            original_message_id: "m1".into(),
            final_recipient: "bob".into(),
        }),
        5,
    )
    .with_addressing(Addressing {
        sender_id: "alice".into(),
        recipient_id: "bob".into(),
    });

    let codec = Codec::default();
    let bytes = codec.encode(&message).unwrap();
    assert_eq!(bytes[0] & FLAG_ADDRESSING, FLAG_ADDRESSING);
    assert_eq!(codec.decode(&bytes).unwrap().addressing, message.addressing);
}

#[test]
fn test_large_relay_is_compressed_and_restored() {
    let message = ProtocolMessage::new(Payload::Relay(relay_message(vec![0u8; 4_096])), 7);
    let codec = Codec::new(256);

    let bytes = codec.encode(&message).unwrap();
    assert_eq!(bytes[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
    assert!(bytes.len() < 4_096);

    let decoded = codec.decode(&bytes).unwrap();
    assert!(decoded.compressed);
    assert_eq!(decoded.payload, message.payload);
}

#[test]
fn test_incompressible_payload_is_sent_raw() {
    let noise: Vec<u8> = (0..2_048u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect();
    let message = ProtocolMessage::new(Payload::Relay(relay_message(noise)), 7);
    let codec = Codec::new(256);

    let bytes = codec.encode(&message).unwrap();
    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded.payload, message.payload);
    assert_eq!(decoded.compressed, bytes[0] & FLAG_COMPRESSED != 0);
}

#[test]
fn test_legacy_envelope_decodes() {
    let codec = Codec::default();
    let payload = Payload::RelayAck(RelayAck {
        original_message_id: "m9".into(),
        final_recipient: "carol".into(),
    });
    let bytes = codec.encode_legacy(&payload).unwrap();
    assert_eq!(bytes[0], MessageType::RelayAck as u8);

    let decoded = codec.decode(&bytes).unwrap();
    assert_eq!(decoded.payload, payload);
    assert!(!decoded.compressed);
    assert!(decoded.signature.is_none());
}

#[test]
fn test_trailing_garbage_rejected() {
    let codec = Codec::default();
    let mut bytes = codec
        .encode(&ProtocolMessage::new(Payload::ContactStatusAck, 1))
        .unwrap();
    bytes.push(0xff);
    assert_eq!(codec.decode(&bytes), Err(CodecError::TrailingBytes));
}

#[test]
fn test_declared_length_beyond_buffer_is_truncated() {
    let codec = Codec::default();
    let mut bytes = codec
        .encode(&ProtocolMessage::new(Payload::ContactStatusAck, 1))
        .unwrap();
    bytes[13] = bytes[13].wrapping_add(10);
    assert_eq!(codec.decode(&bytes), Err(CodecError::Truncated));
}

#[test]
fn test_empty_input() {
    assert_eq!(Codec::default().decode(&[]), Err(CodecError::Empty));
}
