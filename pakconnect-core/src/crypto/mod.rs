// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cryptographic primitives.
//!
//! Signing, key derivation and hashing use `ring`; the AEAD is
//! XChaCha20-Poly1305 and key agreement is X25519.

pub mod encryption;
pub mod exchange;
pub mod kdf;
pub mod signing;

pub use encryption::{open, seal, CipherError, SymmetricKey};
pub use exchange::ExchangeKeyPair;
pub use kdf::{hmac_sha256, verify_hmac_sha256, HKDF};
pub use signing::{PublicKey, Signature, SigningKeyPair};
