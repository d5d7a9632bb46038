// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tiered Encryption Layer
//!
//! Three trust tiers, weakest first:
//!
//! - **Global**: key derived from the network-wide secret; always available.
//! - **Pairing**: key derived from the per-peer pairing secret.
//! - **ECDH**: key derived from an X25519 shared secret; only for verified peers.
//!
//! Ciphertext format: `tier (1 byte) || nonce || ciphertext || tag`. The tier
//! byte is bound into the AEAD as associated data.
//!
//! Every sealed message is signed over
//! `sender | recipient | message id | timestamp | ciphertext`, so relays can
//! forward it untouched.

mod pairing;

pub use pairing::{PairingKeys, PairingSession, PAIRING_CODE_LEN};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EncryptionConfig;
use crate::crypto::{open, seal, PublicKey, Signature, SymmetricKey, HKDF};
use crate::identity::{ContactDirectory, LocalIdentity, PairingState};

/// Encryption layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Decryption failed with every available tier (tried {tried:?})")]
    DecryptionFailed { tried: Vec<EncryptionTier> },

    #[error("Untrusted message: signature invalid for sender {0}")]
    SignatureInvalid(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Pairing failed: {0}")]
    Pairing(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
}

/// Encryption tier. Higher values are stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptionTier {
    Global = 1,
    Pairing = 2,
    Ecdh = 3,
}

impl EncryptionTier {
    /// All tiers, strongest first.
    pub const DESCENDING: [EncryptionTier; 3] = [
        EncryptionTier::Ecdh,
        EncryptionTier::Pairing,
        EncryptionTier::Global,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EncryptionTier::Global),
            2 => Some(EncryptionTier::Pairing),
            3 => Some(EncryptionTier::Ecdh),
            _ => None,
        }
    }

    fn info(self) -> &'static [u8] {
        match self {
            EncryptionTier::Global => b"PakConnect_Tier_Global",
            EncryptionTier::Pairing => b"PakConnect_Tier_Pairing",
            EncryptionTier::Ecdh => b"PakConnect_Tier_Ecdh",
        }
    }
}

/// Encrypted, signed application content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedContent {
    pub message_id: String,
    pub timestamp: u64,
    /// Tier-tagged ciphertext.
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature (64 bytes).
    pub signature: Vec<u8>,
}

impl SealedContent {
    /// Tier named by the ciphertext tag, if it is a known tier.
    pub fn tier(&self) -> Option<EncryptionTier> {
        self.ciphertext.first().copied().and_then(EncryptionTier::from_tag)
    }
}

/// Result of sealing: the content plus the id it was signed under.
#[derive(Debug, Clone)]
pub struct SealedOutbound {
    pub sender_id: String,
    pub content: SealedContent,
}

/// Selects tiers, encrypts, signs, verifies and decrypts.
pub struct EncryptionLayer {
    identity: Arc<LocalIdentity>,
    directory: Arc<dyn ContactDirectory>,
    global_key: SymmetricKey,
}

impl EncryptionLayer {
    pub fn new(
        identity: Arc<LocalIdentity>,
        directory: Arc<dyn ContactDirectory>,
        config: &EncryptionConfig,
    ) -> Self {
        let global_key = SymmetricKey::from_bytes(HKDF::derive_key(
            Some(b"PakConnect_Global_Salt"),
            config.global_secret.as_bytes(),
            EncryptionTier::Global.info(),
        ));
        EncryptionLayer {
            identity,
            directory,
            global_key,
        }
    }

    fn key_for(&self, tier: EncryptionTier, peer_id: &str) -> Option<SymmetricKey> {
        match tier {
            EncryptionTier::Global => Some(self.global_key.clone()),
            EncryptionTier::Pairing => {
                let secret = self.directory.pairing_secret_for(peer_id)?;
                Some(SymmetricKey::from_bytes(HKDF::derive_key(
                    Some(b"PakConnect_Pairing_Salt"),
                    &secret,
                    tier.info(),
                )))
            }
            EncryptionTier::Ecdh => {
                let peer = self.directory.lookup(peer_id)?;
                if peer.pairing_state != PairingState::Verified {
                    return None;
                }
                let their_public = peer.exchange_public_key?;
                let shared = self.identity.exchange_keypair().diffie_hellman(&their_public);
                Some(SymmetricKey::from_bytes(HKDF::derive_key(
                    Some(b"PakConnect_Ecdh_Salt"),
                    &shared,
                    tier.info(),
                )))
            }
        }
    }

    /// Tiers usable with `peer_id`, strongest first.
    pub fn available_tiers(&self, peer_id: &str) -> Vec<EncryptionTier> {
        EncryptionTier::DESCENDING
            .into_iter()
            .filter(|tier| self.key_for(*tier, peer_id).is_some())
            .collect()
    }

    /// Strongest tier usable with `peer_id`.
    pub fn tier_for(&self, peer_id: &str) -> EncryptionTier {
        self.available_tiers(peer_id)
            .first()
            .copied()
            .unwrap_or(EncryptionTier::Global)
    }

    /// Encrypts under the strongest tier available for `recipient_id`.
    pub fn encrypt(&self, plaintext: &[u8], recipient_id: &str) -> Result<Vec<u8>, EncryptionError> {
        let tier = self.tier_for(recipient_id);
        let key = self
            .key_for(tier, recipient_id)
            .ok_or(EncryptionError::EncryptionFailed)?;

        let sealed =
            seal(&key, plaintext, &[tier.tag()]).map_err(|_| EncryptionError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(1 + sealed.len());
        output.push(tier.tag());
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    /// Decrypts tier-tagged ciphertext from `sender_id`.
    ///
    /// Tries the tagged tier first, then every other available tier from
    /// strongest to weakest.
    pub fn decrypt(&self, ciphertext: &[u8], sender_id: &str) -> Result<Vec<u8>, EncryptionError> {
        let Some((&tag, body)) = ciphertext.split_first() else {
            return Err(EncryptionError::DecryptionFailed { tried: Vec::new() });
        };

        let tagged = EncryptionTier::from_tag(tag);
        let order = tagged.into_iter().chain(
            EncryptionTier::DESCENDING
                .into_iter()
                .filter(move |tier| Some(*tier) != tagged),
        );

        let mut tried = Vec::new();
        for tier in order {
            let Some(key) = self.key_for(tier, sender_id) else {
                continue;
            };
            tried.push(tier);
            if let Ok(plaintext) = open(&key, body, &[tier.tag()]) {
                if Some(tier) != tagged {
                    debug!(?tier, tag, sender = %sender_id, "Decrypted with fallback tier");
                }
                return Ok(plaintext);
            }
        }

        warn!(sender = %sender_id, ?tried, "Decryption failed with every tier");
        Err(EncryptionError::DecryptionFailed { tried })
    }

    /// Id this node signs under when talking to `recipient_id`: the
    /// persistent id once the recipient is paired, the ephemeral id before.
    pub fn signing_id_for(&self, recipient_id: &str) -> String {
        if self.is_paired(recipient_id) {
            self.identity.persistent_id()
        } else {
            self.identity.ephemeral_id()
        }
    }

    fn is_paired(&self, peer_id: &str) -> bool {
        self.directory
            .lookup(peer_id)
            .is_some_and(|peer| peer.is_paired())
    }

    /// Encrypts and signs `plaintext` for `recipient_id`.
    pub fn seal(
        &self,
        recipient_id: &str,
        message_id: &str,
        timestamp: u64,
        plaintext: &[u8],
    ) -> Result<SealedOutbound, EncryptionError> {
        let ciphertext = self.encrypt(plaintext, recipient_id)?;
        let paired = self.is_paired(recipient_id);
        let sender_id = if paired {
            self.identity.persistent_id()
        } else {
            self.identity.ephemeral_id()
        };

        let signed = signed_bytes(&sender_id, recipient_id, message_id, timestamp, &ciphertext);
        let signature = if paired {
            self.identity.sign_persistent(&signed)
        } else {
            self.identity.sign_ephemeral(&signed)
        };

        Ok(SealedOutbound {
            sender_id,
            content: SealedContent {
                message_id: message_id.to_string(),
                timestamp,
                ciphertext,
                signature: signature.as_bytes().to_vec(),
            },
        })
    }

    /// Verifies the signature on `content`.
    pub fn verify(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &SealedContent,
    ) -> Result<(), EncryptionError> {
        let public_key = PublicKey::from_fingerprint(sender_id)
            .or_else(|| {
                self.directory
                    .persistent_key_for(sender_id)
                    .map(PublicKey::from_bytes)
            })
            .ok_or_else(|| EncryptionError::SignatureInvalid(sender_id.to_string()))?;

        let signature: [u8; 64] = content
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::SignatureInvalid(sender_id.to_string()))?;

        let signed = signed_bytes(
            sender_id,
            recipient_id,
            &content.message_id,
            content.timestamp,
            &content.ciphertext,
        );

        if public_key.verify(&signed, &Signature::from_bytes(signature)) {
            Ok(())
        } else {
            warn!(sender = %sender_id, message_id = %content.message_id, "Signature verification failed");
            Err(EncryptionError::SignatureInvalid(sender_id.to_string()))
        }
    }

    /// Verifies then decrypts `content`. Unverifiable content is never
    /// decrypted.
    pub fn open(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &SealedContent,
    ) -> Result<Vec<u8>, EncryptionError> {
        self.verify(sender_id, recipient_id, content)?;
        self.decrypt(&content.ciphertext, sender_id)
    }

    /// Marks a paired peer as verified, enabling the ECDH tier.
    pub fn mark_verified(&self, peer_id: &str) -> bool {
        let Some(mut peer) = self.directory.lookup(peer_id) else {
            return false;
        };
        if !peer.mark_verified() {
            return false;
        }
        self.directory.upsert(peer);
        true
    }
}

fn signed_bytes(
    sender_id: &str,
    recipient_id: &str,
    message_id: &str,
    timestamp: u64,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(
        sender_id.len() + recipient_id.len() + message_id.len() + ciphertext.len() + 32,
    );
    for field in [sender_id.as_bytes(), recipient_id.as_bytes(), message_id.as_bytes()] {
        data.extend_from_slice(&(field.len() as u32).to_be_bytes());
        data.extend_from_slice(field);
    }
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(ciphertext);
    data
}
