// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HKDF Key Derivation Function
//!
//! HMAC-SHA256 extract-and-expand (RFC 5869), used to turn shared secrets and
//! pairing codes into tier keys with per-purpose domain separation. Plain
//! HMAC tags bind pairing key disclosures to the derived secret.

use ring::hmac;

/// HKDF-SHA256 key derivation.
pub struct HKDF;

impl HKDF {
    /// HKDF Extract: PRK = HMAC-SHA256(salt, IKM).
    ///
    /// If salt is None, uses a string of HashLen zeros.
    pub fn extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; 32] {
        let default_salt = [0u8; 32];
        let key = hmac::Key::new(hmac::HMAC_SHA256, salt.unwrap_or(&default_salt));
        let tag = hmac::sign(&key, ikm);
        let mut prk = [0u8; 32];
        prk.copy_from_slice(tag.as_ref());
        prk
    }

    /// HKDF Expand for a single 32-byte block: T(1) = HMAC(PRK, info || 0x01).
    pub fn expand_32(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
        let key = hmac::Key::new(hmac::HMAC_SHA256, prk);
        let mut input = Vec::with_capacity(info.len() + 1);
        input.extend_from_slice(info);
        input.push(1);
        let tag = hmac::sign(&key, &input);
        let mut okm = [0u8; 32];
        okm.copy_from_slice(tag.as_ref());
        okm
    }

    /// Extract-then-expand to a 32-byte key.
    pub fn derive_key(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 32] {
        let prk = Self::extract(salt, ikm);
        Self::expand_32(&prk, info)
    }
}

/// HMAC-SHA256 tag of `data` under `key`.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(hmac::sign(&key, data).as_ref());
    tag
}

/// Constant-time check of an HMAC-SHA256 tag.
pub fn verify_hmac_sha256(key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, data, tag).is_ok()
}
