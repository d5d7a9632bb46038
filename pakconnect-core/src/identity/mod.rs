// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identity Management Module
//!
//! The local node owns a master seed from which its persistent Ed25519
//! signing key and X25519 exchange key are derived. A separate ephemeral
//! signing key is what unpaired peers see; its hex fingerprint is the node's
//! routing id on the mesh.
//!
//! Remote peers are described by [`PeerIdentity`] and stored through the
//! [`ContactDirectory`] collaborator.

mod directory;

pub use directory::{ContactDirectory, InMemoryDirectory};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::{ExchangeKeyPair, PublicKey, Signature, SigningKeyPair, HKDF};

/// Identity-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Display name cannot be empty")]
    EmptyDisplayName,
    #[error("Malformed peer id: {0}")]
    MalformedId(String),
}

/// The local node's keys and display name.
pub struct LocalIdentity {
    master_seed: [u8; 32],
    persistent: SigningKeyPair,
    ephemeral: SigningKeyPair,
    exchange: ExchangeKeyPair,
    display_name: String,
}

impl Drop for LocalIdentity {
    fn drop(&mut self) {
        self.master_seed.zeroize();
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("display_name", &self.display_name)
            .field("ephemeral_id", &self.ephemeral_id())
            .finish()
    }
}

impl LocalIdentity {
    /// Creates a new identity with a random master seed.
    pub fn create(display_name: &str) -> Result<Self, IdentityError> {
        let mut master_seed = [0u8; 32];
        OsRng.fill_bytes(&mut master_seed);
        let mut ephemeral_seed = [0u8; 32];
        OsRng.fill_bytes(&mut ephemeral_seed);

        let identity = Self::from_seeds(master_seed, ephemeral_seed, display_name);
        master_seed.zeroize();
        ephemeral_seed.zeroize();
        identity
    }

    /// Rebuilds an identity from its master seed and an ephemeral seed.
    pub fn from_seeds(
        master_seed: [u8; 32],
        ephemeral_seed: [u8; 32],
        display_name: &str,
    ) -> Result<Self, IdentityError> {
        if display_name.trim().is_empty() {
            return Err(IdentityError::EmptyDisplayName);
        }

        let signing_seed = HKDF::derive_key(Some(&master_seed), &[], b"PakConnect_Signing_Seed");
        let exchange_seed = HKDF::derive_key(Some(&master_seed), &[], b"PakConnect_Exchange_Seed");

        Ok(LocalIdentity {
            master_seed,
            persistent: SigningKeyPair::from_seed(&signing_seed),
            ephemeral: SigningKeyPair::from_seed(&ephemeral_seed),
            exchange: ExchangeKeyPair::from_bytes(exchange_seed),
            display_name: display_name.to_string(),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Hex fingerprint of the ephemeral signing key; the mesh routing id.
    pub fn ephemeral_id(&self) -> String {
        self.ephemeral.public_key().fingerprint()
    }

    /// Hex fingerprint of the persistent signing key; the id paired peers use.
    pub fn persistent_id(&self) -> String {
        self.persistent.public_key().fingerprint()
    }

    pub fn persistent_public_key(&self) -> [u8; 32] {
        *self.persistent.public_key().as_bytes()
    }

    pub fn exchange_public_key(&self) -> [u8; 32] {
        *self.exchange.public_key()
    }

    pub fn exchange_keypair(&self) -> &ExchangeKeyPair {
        &self.exchange
    }

    /// Returns true if `id` names this node under either identity.
    pub fn is_local_id(&self, id: &str) -> bool {
        id == self.ephemeral_id() || id == self.persistent_id()
    }

    pub fn sign_ephemeral(&self, message: &[u8]) -> Signature {
        self.ephemeral.sign(message)
    }

    pub fn sign_persistent(&self, message: &[u8]) -> Signature {
        self.persistent.sign(message)
    }

    /// Persistent-key signature over the current ephemeral id.
    ///
    /// Sent with every identity announcement. Only a peer that already holds
    /// the persistent public key can check it; paired contacts use it to
    /// recognise this node after its ephemeral id changes.
    pub fn contact_proof(&self) -> Signature {
        self.sign_persistent(&contact_proof_bytes(&self.ephemeral_id()))
    }
}

fn contact_proof_bytes(ephemeral_id: &str) -> Vec<u8> {
    let mut bytes = b"PakConnect_Contact_Proof".to_vec();
    bytes.push(0);
    bytes.extend_from_slice(ephemeral_id.as_bytes());
    bytes
}

/// Checks a contact proof against a known persistent key.
pub fn verify_contact_proof(
    persistent_key: &[u8; 32],
    ephemeral_id: &str,
    proof: &[u8],
) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(proof) else {
        return false;
    };
    PublicKey::from_bytes(*persistent_key)
        .verify(&contact_proof_bytes(ephemeral_id), &Signature::from_bytes(bytes))
}

/// Trust relationship with a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PairingState {
    /// Known only by its ephemeral id.
    Unpaired,
    /// Pairing codes exchanged; a pairing secret is stored.
    Paired,
    /// Paired and keys verified out of band; the ECDH tier is available.
    Verified,
}

/// What this node knows about a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub ephemeral_id: String,
    pub persistent_public_key: Option<[u8; 32]>,
    pub exchange_public_key: Option<[u8; 32]>,
    pub display_name: String,
    pub pairing_state: PairingState,
}

impl PeerIdentity {
    /// Creates an unpaired peer identity, validating the ephemeral id.
    pub fn unpaired(ephemeral_id: &str, display_name: &str) -> Result<Self, IdentityError> {
        if PublicKey::from_fingerprint(ephemeral_id).is_none() {
            return Err(IdentityError::MalformedId(ephemeral_id.to_string()));
        }
        if display_name.trim().is_empty() {
            return Err(IdentityError::EmptyDisplayName);
        }
        Ok(PeerIdentity {
            ephemeral_id: ephemeral_id.to_string(),
            persistent_public_key: None,
            exchange_public_key: None,
            display_name: display_name.to_string(),
            pairing_state: PairingState::Unpaired,
        })
    }

    /// The id this peer is addressed by: the persistent key once paired,
    /// the ephemeral id before that.
    pub fn addressing_id(&self) -> String {
        match (self.pairing_state, self.persistent_public_key) {
            (PairingState::Unpaired, _) | (_, None) => self.ephemeral_id.clone(),
            (_, Some(key)) => hex::encode(key),
        }
    }

    /// Returns true if `id` is either of this peer's ids.
    pub fn matches_id(&self, id: &str) -> bool {
        self.ephemeral_id == id
            || self
                .persistent_public_key
                .is_some_and(|key| hex::encode(key) == id)
    }

    pub fn is_paired(&self) -> bool {
        self.pairing_state >= PairingState::Paired
    }

    /// Upgrades the peer in place once pairing completes.
    pub fn upgrade_to_paired(&mut self, persistent_key: [u8; 32], exchange_key: Option<[u8; 32]>) {
        self.persistent_public_key = Some(persistent_key);
        if exchange_key.is_some() {
            self.exchange_public_key = exchange_key;
        }
        if self.pairing_state < PairingState::Paired {
            self.pairing_state = PairingState::Paired;
        }
    }

    /// Marks a paired peer as verified. Unpaired peers are left unchanged.
    pub fn mark_verified(&mut self) -> bool {
        if self.pairing_state == PairingState::Unpaired || self.persistent_public_key.is_none() {
            return false;
        }
        self.pairing_state = PairingState::Verified;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeds_are_deterministic() {
        let a = LocalIdentity::from_seeds([1u8; 32], [2u8; 32], "Alice").unwrap();
        let b = LocalIdentity::from_seeds([1u8; 32], [9u8; 32], "Alice").unwrap();
        assert_eq!(a.persistent_id(), b.persistent_id());
        assert_eq!(a.exchange_public_key(), b.exchange_public_key());
        assert_ne!(a.ephemeral_id(), b.ephemeral_id());
        assert_ne!(a.ephemeral_id(), a.persistent_id());
    }

    #[test]
    fn test_empty_display_name_rejected() {
        assert_eq!(
            LocalIdentity::from_seeds([1u8; 32], [2u8; 32], "  ").unwrap_err(),
            IdentityError::EmptyDisplayName
        );
    }

    #[test]
    fn test_addressing_id_switches_on_pairing() {
        let local = LocalIdentity::create("Bob").unwrap();
        let mut peer = PeerIdentity::unpaired(&local.ephemeral_id(), "Bob").unwrap();
        assert_eq!(peer.addressing_id(), local.ephemeral_id());
        assert!(!peer.mark_verified());

        peer.upgrade_to_paired(local.persistent_public_key(), None);
        assert_eq!(peer.addressing_id(), local.persistent_id());
        assert!(peer.matches_id(&local.ephemeral_id()));
        assert!(peer.matches_id(&local.persistent_id()));
        assert!(peer.mark_verified());
        assert_eq!(peer.pairing_state, PairingState::Verified);
    }

    #[test]
    fn test_contact_proof_survives_new_ephemeral_id() {
        let before = LocalIdentity::from_seeds([7u8; 32], [1u8; 32], "Erin").unwrap();
        let after = LocalIdentity::from_seeds([7u8; 32], [2u8; 32], "Erin").unwrap();
        let stranger = LocalIdentity::from_seeds([8u8; 32], [2u8; 32], "Erin").unwrap();
        let proof = after.contact_proof();

        assert!(verify_contact_proof(
            &before.persistent_public_key(),
            &after.ephemeral_id(),
            proof.as_bytes()
        ));
        // Bound to the ephemeral id it was made for.
        assert!(!verify_contact_proof(
            &before.persistent_public_key(),
            &before.ephemeral_id(),
            proof.as_bytes()
        ));
        assert!(!verify_contact_proof(
            &stranger.persistent_public_key(),
            &after.ephemeral_id(),
            proof.as_bytes()
        ));
        assert!(!verify_contact_proof(
            &before.persistent_public_key(),
            &after.ephemeral_id(),
            &[0u8; 12]
        ));
    }

    #[test]
    fn test_malformed_ephemeral_id_rejected() {
        assert!(matches!(
            PeerIdentity::unpaired("zz", "Eve"),
            Err(IdentityError::MalformedId(_))
        ));
    }
}
