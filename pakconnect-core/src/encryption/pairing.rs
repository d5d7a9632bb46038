// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pairing code exchange.
//!
//! Each side shows a six-digit code and types in the other side's code. The
//! pairing secret is derived from both codes and both ephemeral ids, ordered
//! by id so both sides derive the same bytes.
//!
//! Once both codes are entered, each side discloses its persistent and
//! exchange public keys in a [`PairingKeys`] message. The disclosure is
//! signed with both of the sender's keys and tagged with an HMAC under the
//! derived secret, so it only verifies when both users typed the right codes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroize;

use super::EncryptionError;
use crate::crypto::{hmac_sha256, verify_hmac_sha256, PublicKey, Signature, HKDF};
use crate::identity::{ContactDirectory, LocalIdentity, PeerIdentity};

/// Number of digits in a pairing code.
pub const PAIRING_CODE_LEN: usize = 6;

fn validate_code(code: &str) -> Result<(), EncryptionError> {
    if code.len() == PAIRING_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(EncryptionError::Pairing(format!(
            "pairing code must be {} digits",
            PAIRING_CODE_LEN
        )))
    }
}

/// Public keys one side discloses to the other during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingKeys {
    pub persistent_key: [u8; 32],
    pub exchange_key: [u8; 32],
    /// Ed25519 signature by `persistent_key` over the disclosure.
    pub persistent_signature: Vec<u8>,
    /// Ed25519 signature by the sender's ephemeral key over the disclosure.
    pub ephemeral_signature: Vec<u8>,
    /// HMAC-SHA256 over the disclosure under the pairing secret.
    pub mac: Vec<u8>,
}

fn disclosure_bytes(
    from: &str,
    to: &str,
    persistent_key: &[u8; 32],
    exchange_key: &[u8; 32],
) -> Vec<u8> {
    let mut bytes = b"PakConnect_Pairing_Keys".to_vec();
    for id in [from, to] {
        bytes.push(0);
        bytes.extend_from_slice(id.as_bytes());
    }
    bytes.push(0);
    bytes.extend_from_slice(persistent_key);
    bytes.extend_from_slice(exchange_key);
    bytes
}

fn signature_from(bytes: &[u8]) -> Option<Signature> {
    <[u8; 64]>::try_from(bytes).ok().map(Signature::from_bytes)
}

/// One side of a pairing exchange.
#[derive(Debug)]
pub struct PairingSession {
    local_id: String,
    peer_id: String,
    local_code: String,
    peer_code: Option<String>,
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        self.local_code.zeroize();
        if let Some(code) = self.peer_code.as_mut() {
            code.zeroize();
        }
    }
}

impl PairingSession {
    /// Starts a session with a freshly generated local code.
    pub fn new(local_ephemeral_id: &str, peer_ephemeral_id: &str) -> Self {
        let code = rand::thread_rng().gen_range(0..1_000_000u32);
        PairingSession {
            local_id: local_ephemeral_id.to_string(),
            peer_id: peer_ephemeral_id.to_string(),
            local_code: format!("{:06}", code),
            peer_code: None,
        }
    }

    /// Starts a session with a known local code.
    pub fn with_local_code(
        local_ephemeral_id: &str,
        peer_ephemeral_id: &str,
        code: &str,
    ) -> Result<Self, EncryptionError> {
        validate_code(code)?;
        Ok(PairingSession {
            local_id: local_ephemeral_id.to_string(),
            peer_id: peer_ephemeral_id.to_string(),
            local_code: code.to_string(),
            peer_code: None,
        })
    }

    /// The code to show to the user.
    pub fn local_code(&self) -> &str {
        &self.local_code
    }

    /// Ephemeral id of the peer being paired with.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Returns true once the peer's code has been entered.
    pub fn has_peer_code(&self) -> bool {
        self.peer_code.is_some()
    }

    /// Records the code the user read off the peer's screen.
    pub fn enter_peer_code(&mut self, code: &str) -> Result<(), EncryptionError> {
        validate_code(code)?;
        self.peer_code = Some(code.to_string());
        Ok(())
    }

    /// Derives the shared pairing secret.
    pub fn derive_secret(&self) -> Result<[u8; 32], EncryptionError> {
        let peer_code = self
            .peer_code
            .as_deref()
            .ok_or_else(|| EncryptionError::Pairing("peer code not entered".to_string()))?;

        let mut sides = [
            (self.local_id.as_str(), self.local_code.as_str()),
            (self.peer_id.as_str(), peer_code),
        ];
        sides.sort();

        let mut ikm = Vec::new();
        for (id, code) in sides {
            ikm.extend_from_slice(id.as_bytes());
            ikm.push(0);
            ikm.extend_from_slice(code.as_bytes());
            ikm.push(0);
        }
        let secret = HKDF::derive_key(
            Some(b"PakConnect_Pairing"),
            &ikm,
            b"PakConnect_Pairing_Secret",
        );
        ikm.zeroize();
        Ok(secret)
    }

    /// Builds this side's key disclosure. Fails until the peer code is entered.
    pub fn disclose(&self, identity: &LocalIdentity) -> Result<PairingKeys, EncryptionError> {
        let mut secret = self.derive_secret()?;
        let persistent_key = identity.persistent_public_key();
        let exchange_key = identity.exchange_public_key();
        let signed = disclosure_bytes(
            &self.local_id,
            &self.peer_id,
            &persistent_key,
            &exchange_key,
        );
        let mac = hmac_sha256(&secret, &signed).to_vec();
        secret.zeroize();

        Ok(PairingKeys {
            persistent_key,
            exchange_key,
            persistent_signature: identity.sign_persistent(&signed).as_bytes().to_vec(),
            ephemeral_signature: identity.sign_ephemeral(&signed).as_bytes().to_vec(),
            mac,
        })
    }

    /// Checks the peer's disclosure against the codes and the peer's keys.
    pub fn verify(&self, keys: &PairingKeys) -> Result<(), EncryptionError> {
        let mut secret = self.derive_secret()?;
        let signed = disclosure_bytes(
            &self.peer_id,
            &self.local_id,
            &keys.persistent_key,
            &keys.exchange_key,
        );
        let mac_ok = verify_hmac_sha256(&secret, &signed, &keys.mac);
        secret.zeroize();
        if !mac_ok {
            warn!(peer = %self.peer_id, "Pairing disclosure does not match the entered codes");
            return Err(EncryptionError::Pairing("pairing codes do not match".to_string()));
        }

        let ephemeral = PublicKey::from_fingerprint(&self.peer_id)
            .ok_or_else(|| EncryptionError::UnknownPeer(self.peer_id.clone()))?;
        let persistent = PublicKey::from_bytes(keys.persistent_key);
        let signed_by = |key: &PublicKey, signature: &[u8]| {
            signature_from(signature).is_some_and(|signature| key.verify(&signed, &signature))
        };
        if !signed_by(&persistent, &keys.persistent_signature)
            || !signed_by(&ephemeral, &keys.ephemeral_signature)
        {
            return Err(EncryptionError::SignatureInvalid(self.peer_id.clone()));
        }
        Ok(())
    }

    /// Verifies the peer's disclosure, stores the pairing secret and
    /// upgrades the peer to paired.
    pub fn complete(
        &self,
        directory: &dyn ContactDirectory,
        keys: &PairingKeys,
    ) -> Result<PeerIdentity, EncryptionError> {
        self.verify(keys)?;
        let secret = self.derive_secret()?;
        let mut peer = directory
            .lookup(&self.peer_id)
            .ok_or_else(|| EncryptionError::UnknownPeer(self.peer_id.clone()))?;

        peer.upgrade_to_paired(keys.persistent_key, Some(keys.exchange_key));
        directory.upsert(peer.clone());
        directory.store_pairing_secret(&peer.ephemeral_id, secret);

        info!(peer = %peer.ephemeral_id, "Pairing completed");
        Ok(peer)
    }
}
