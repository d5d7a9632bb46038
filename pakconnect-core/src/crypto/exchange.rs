// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! X25519 key agreement for the ECDH encryption tier.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Long-lived X25519 keypair for per-peer ECDH secrets.
pub struct ExchangeKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ExchangeKeyPair {
    /// Generates a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        ExchangeKeyPair { secret, public }
    }

    /// Creates a keypair from a 32-byte secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        ExchangeKeyPair { secret, public }
    }

    /// Returns the public key bytes.
    pub fn public_key(&self) -> &[u8; 32] {
        self.public.as_bytes()
    }

    /// Raw Diffie-Hellman with a peer's public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        *shared.as_bytes()
    }
}

impl std::fmt::Debug for ExchangeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}
