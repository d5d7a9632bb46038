// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tier selection, signing identity and decryption fallback.

mod common;

use std::sync::Arc;

use pakconnect_core::{
    ContactDirectory, EncryptionConfig, EncryptionError, EncryptionLayer, EncryptionTier,
    InMemoryDirectory, LocalIdentity, PairingSession, PeerIdentity,
};

struct Party {
    identity: Arc<LocalIdentity>,
    directory: Arc<InMemoryDirectory>,
    layer: EncryptionLayer,
}

fn party(name: &str, seed: u8) -> Party {
    party_with_secret(name, seed, &EncryptionConfig::default())
}

fn party_with_secret(name: &str, seed: u8, config: &EncryptionConfig) -> Party {
    let identity = common::identity(name, seed);
    let directory = Arc::new(InMemoryDirectory::new());
    let layer = EncryptionLayer::new(identity.clone(), directory.clone(), config);
    Party {
        identity,
        directory,
        layer,
    }
}

fn pair(a: &Party, b: &Party) {
    let a_id = a.identity.ephemeral_id();
    let b_id = b.identity.ephemeral_id();
    a.directory
        .upsert(PeerIdentity::unpaired(&b_id, b.identity.display_name()).unwrap());
    b.directory
        .upsert(PeerIdentity::unpaired(&a_id, a.identity.display_name()).unwrap());

    let mut a_session = PairingSession::with_local_code(&a_id, &b_id, "111111").unwrap();
    let mut b_session = PairingSession::with_local_code(&b_id, &a_id, "222222").unwrap();
    a_session.enter_peer_code("222222").unwrap();
    b_session.enter_peer_code("111111").unwrap();

    let a_keys = a_session.disclose(&a.identity).unwrap();
    let b_keys = b_session.disclose(&b.identity).unwrap();
    a_session.complete(a.directory.as_ref(), &b_keys).unwrap();
    b_session.complete(b.directory.as_ref(), &a_keys).unwrap();
}

#[test]
fn test_strangers_use_global_tier_and_ephemeral_signatures() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    let alice_id = alice.identity.ephemeral_id();

    let sealed = bob.layer.seal(&alice_id, "m1", 10, b"hello").unwrap();
    assert_eq!(sealed.sender_id, bob.identity.ephemeral_id());
    assert_eq!(sealed.content.tier(), Some(EncryptionTier::Global));

    let plaintext = alice
        .layer
        .open(&sealed.sender_id, &alice_id, &sealed.content)
        .unwrap();
    assert_eq!(plaintext, b"hello");
}

#[test]
fn test_paired_peers_use_pairing_tier_and_persistent_ids() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    pair(&alice, &bob);
    let alice_persistent = alice.identity.persistent_id();

    assert_eq!(
        bob.layer.available_tiers(&alice_persistent),
        vec![EncryptionTier::Pairing, EncryptionTier::Global]
    );
    let sealed = bob.layer.seal(&alice_persistent, "m1", 10, b"hi").unwrap();
    assert_eq!(sealed.sender_id, bob.identity.persistent_id());
    assert_eq!(sealed.content.tier(), Some(EncryptionTier::Pairing));

    let plaintext = alice
        .layer
        .open(&sealed.sender_id, &alice_persistent, &sealed.content)
        .unwrap();
    assert_eq!(plaintext, b"hi");
}

#[test]
fn test_verified_peers_use_ecdh_tier() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    pair(&alice, &bob);
    assert!(alice.layer.mark_verified(&bob.identity.ephemeral_id()));
    assert!(bob.layer.mark_verified(&alice.identity.ephemeral_id()));

    let alice_persistent = alice.identity.persistent_id();
    assert_eq!(bob.layer.tier_for(&alice_persistent), EncryptionTier::Ecdh);

    let sealed = bob.layer.seal(&alice_persistent, "m1", 10, b"secret").unwrap();
    assert_eq!(sealed.content.tier(), Some(EncryptionTier::Ecdh));
    let plaintext = alice
        .layer
        .open(&sealed.sender_id, &alice_persistent, &sealed.content)
        .unwrap();
    assert_eq!(plaintext, b"secret");
}

#[test]
fn test_unpaired_peer_cannot_be_verified() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    alice
        .directory
        .upsert(PeerIdentity::unpaired(&bob.identity.ephemeral_id(), "Bob").unwrap());
    assert!(!alice.layer.mark_verified(&bob.identity.ephemeral_id()));
    assert_eq!(
        alice.layer.tier_for(&bob.identity.ephemeral_id()),
        EncryptionTier::Global
    );
}

#[test]
fn test_rotated_pairing_secret_fails_after_trying_every_tier() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    pair(&alice, &bob);
    let bob_persistent = bob.identity.persistent_id();

    let ciphertext = bob
        .layer
        .encrypt(b"before rotation", &alice.identity.persistent_id())
        .unwrap();
    assert_eq!(ciphertext[0], EncryptionTier::Pairing.tag());

    alice
        .directory
        .store_pairing_secret(&bob.identity.ephemeral_id(), [7u8; 32]);

    let result = alice.layer.decrypt(&ciphertext, &bob_persistent);
    assert_eq!(
        result,
        Err(EncryptionError::DecryptionFailed {
            tried: vec![EncryptionTier::Pairing, EncryptionTier::Global],
        })
    );
}

#[test]
fn test_stale_tier_tag_falls_back_to_matching_tier() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    pair(&alice, &bob);

    // Bob's old install knows nothing of the pairing and encrypts globally.
    let stale_bob = party("Bob", 2);
    let mut ciphertext = stale_bob
        .layer
        .encrypt(b"fallback", &alice.identity.ephemeral_id())
        .unwrap();
    assert_eq!(ciphertext[0], EncryptionTier::Global.tag());
    ciphertext[0] = EncryptionTier::Pairing.tag();

    let plaintext = alice
        .layer
        .decrypt(&ciphertext, &bob.identity.ephemeral_id())
        .unwrap();
    assert_eq!(plaintext, b"fallback");
}

#[test]
fn test_foreign_network_secret_never_passes_ciphertext_through() {
    let alice = party("Alice", 1);
    let mallory = party_with_secret(
        "Mallory",
        3,
        &EncryptionConfig::default().with_global_secret("another-network"),
    );

    let ciphertext = mallory
        .layer
        .encrypt(b"plain", &alice.identity.ephemeral_id())
        .unwrap();
    let result = alice
        .layer
        .decrypt(&ciphertext, &mallory.identity.ephemeral_id());
    assert!(matches!(
        result,
        Err(EncryptionError::DecryptionFailed { .. })
    ));
}

#[test]
fn test_tampered_content_is_rejected_before_decryption() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    let alice_id = alice.identity.ephemeral_id();

    let mut sealed = bob.layer.seal(&alice_id, "m1", 10, b"hello").unwrap();
    sealed.content.timestamp += 1;

    assert_eq!(
        alice
            .layer
            .open(&sealed.sender_id, &alice_id, &sealed.content),
        Err(EncryptionError::SignatureInvalid(sealed.sender_id.clone()))
    );
}

#[test]
fn test_signature_binds_recipient() {
    let alice = party("Alice", 1);
    let bob = party("Bob", 2);
    let carol = party("Carol", 3);

    let sealed = bob
        .layer
        .seal(&alice.identity.ephemeral_id(), "m1", 10, b"for alice")
        .unwrap();
    let carol_id = carol.identity.ephemeral_id();
    assert!(matches!(
        carol.layer.open(&sealed.sender_id, &carol_id, &sealed.content),
        Err(EncryptionError::SignatureInvalid(_))
    ));
}
