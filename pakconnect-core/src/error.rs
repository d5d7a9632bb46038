// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mesh Error Types
//!
//! Unified error type for [`MeshNode`](crate::MeshNode) operations.

use thiserror::Error;

use crate::encryption::EncryptionError;
use crate::handshake::HandshakeError;
use crate::identity::IdentityError;
use crate::queue::QueueError;
use crate::relay::RelayError;
use crate::store::StoreError;
use crate::transport::{CodecError, TransportError};

/// Unified error type for mesh operations.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Link write or acknowledgement failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Handshake timed out, was rejected or was cancelled.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Decryption or signature verification failed.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Includes capacity rejections at enqueue.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("message store error: {0}")]
    Store(#[from] StoreError),

    /// The link exists but its handshake has not completed.
    #[error("session with {0} is not ready")]
    SessionNotReady(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("unknown link: {0}")]
    UnknownLink(String),

    /// Inbound message that is well-formed on the wire but not for us.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
