// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ed25519 Digital Signatures
//!
//! Signing keypairs for the ephemeral and persistent peer identities.

use rand::rngs::OsRng;
use rand::RngCore;
use ring::signature::{Ed25519KeyPair, KeyPair as RingKeyPair, UnparsedPublicKey, ED25519};
use zeroize::Zeroize;

/// Ed25519 signing keypair.
///
/// Private key material is zeroed on drop.
pub struct SigningKeyPair {
    keypair: Ed25519KeyPair,
    seed: [u8; 32],
}

impl Drop for SigningKeyPair {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &self.public_key().fingerprint())
            .finish()
    }
}

impl SigningKeyPair {
    /// Generates a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let keypair = Self::from_seed(&seed);
        seed.zeroize();
        keypair
    }

    /// Creates a keypair from a 32-byte seed.
    ///
    /// Any 32 bytes form a valid Ed25519 seed, so this cannot fail.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        #[allow(clippy::expect_used)]
        let keypair =
            Ed25519KeyPair::from_seed_unchecked(seed).expect("Seed should be valid for Ed25519");

        SigningKeyPair {
            keypair,
            seed: *seed,
        }
    }

    /// Returns the public key portion of this keypair.
    pub fn public_key(&self) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.keypair.public_key().as_ref());
        PublicKey { bytes }
    }

    /// Signs a message and returns the signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.keypair.sign(message);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(sig.as_ref());
        Signature { bytes }
    }
}

/// Ed25519 public key for verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; 32],
}

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey { bytes }
    }

    /// Parses a hex fingerprint back into a public key.
    pub fn from_fingerprint(fingerprint: &str) -> Option<Self> {
        let decoded = hex::decode(fingerprint).ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        Some(PublicKey { bytes })
    }

    /// Returns the raw bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Full lowercase hex encoding; doubles as the peer addressing id.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Verifies a signature against a message using this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        UnparsedPublicKey::new(&ED25519, &self.bytes)
            .verify(message, &signature.bytes)
            .is_ok()
    }
}

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl Signature {
    /// Creates a signature from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature { bytes }
    }

    /// Returns the raw bytes of the signature.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"test message");
        assert!(kp.public_key().verify(b"test message", &sig));
        assert!(!kp.public_key().verify(b"other message", &sig));
    }

    #[test]
    fn test_fingerprint_roundtrip() {
        let kp = SigningKeyPair::from_seed(&[3u8; 32]);
        let fp = kp.public_key().fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(PublicKey::from_fingerprint(&fp), Some(kp.public_key()));
        assert_eq!(PublicKey::from_fingerprint("not-hex"), None);
    }
}
