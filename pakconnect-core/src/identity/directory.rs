// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Contact directory seam.
//!
//! The mesh core never owns contact records; it reads trust state and
//! writes resolved identities through this trait.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::PeerIdentity;

/// Contact storage consumed by the core.
///
/// Every lookup accepts either of a peer's ids (ephemeral or persistent hex).
pub trait ContactDirectory: Send + Sync {
    fn lookup(&self, id: &str) -> Option<PeerIdentity>;
    fn persistent_key_for(&self, id: &str) -> Option<[u8; 32]>;
    fn pairing_secret_for(&self, id: &str) -> Option<[u8; 32]>;
    fn is_favorite(&self, id: &str) -> bool;
    fn upsert(&self, peer: PeerIdentity);
    fn store_pairing_secret(&self, id: &str, secret: [u8; 32]);
    /// Every peer at pairing state `Paired` or above.
    fn paired_peers(&self) -> Vec<PeerIdentity>;
}

#[derive(Default)]
struct DirectoryState {
    peers: HashMap<String, PeerIdentity>,
    aliases: HashMap<String, String>,
    secrets: HashMap<String, [u8; 32]>,
    favorites: HashSet<String>,
}

impl DirectoryState {
    fn resolve(&self, id: &str) -> Option<String> {
        if self.peers.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases.get(id).cloned()
    }
}

/// In-memory directory for tests and simulations.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a peer as favorite. Accepts either id.
    pub fn set_favorite(&self, id: &str, favorite: bool) {
        let mut state = self.state();
        let key = state.resolve(id).unwrap_or_else(|| id.to_string());
        if favorite {
            state.favorites.insert(key);
        } else {
            state.favorites.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.state().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContactDirectory for InMemoryDirectory {
    fn lookup(&self, id: &str) -> Option<PeerIdentity> {
        let state = self.state();
        let key = state.resolve(id)?;
        state.peers.get(&key).cloned()
    }

    fn persistent_key_for(&self, id: &str) -> Option<[u8; 32]> {
        self.lookup(id)
            .filter(|peer| peer.is_paired())
            .and_then(|peer| peer.persistent_public_key)
    }

    fn pairing_secret_for(&self, id: &str) -> Option<[u8; 32]> {
        let state = self.state();
        let key = state.resolve(id).unwrap_or_else(|| id.to_string());
        state.secrets.get(&key).copied()
    }

    fn is_favorite(&self, id: &str) -> bool {
        let state = self.state();
        let key = state.resolve(id).unwrap_or_else(|| id.to_string());
        state.favorites.contains(&key)
    }

    fn upsert(&self, peer: PeerIdentity) {
        let mut state = self.state();
        // A peer that reconnects under a new ephemeral id keeps its record
        // when its persistent key is already known.
        let persistent_hex = peer.persistent_public_key.map(hex::encode);
        let existing = state.resolve(&peer.ephemeral_id).or_else(|| {
            persistent_hex
                .as_deref()
                .and_then(|hex_id| state.resolve(hex_id))
        });

        if let Some(old_key) = existing.filter(|old| *old != peer.ephemeral_id) {
            state.peers.remove(&old_key);
            if let Some(secret) = state.secrets.remove(&old_key) {
                state.secrets.insert(peer.ephemeral_id.clone(), secret);
            }
            if state.favorites.remove(&old_key) {
                state.favorites.insert(peer.ephemeral_id.clone());
            }
            let stale: Vec<String> = state
                .aliases
                .iter()
                .filter(|(_, target)| **target == old_key)
                .map(|(alias, _)| alias.clone())
                .collect();
            for alias in stale {
                state.aliases.insert(alias, peer.ephemeral_id.clone());
            }
            state.aliases.insert(old_key, peer.ephemeral_id.clone());
        }

        if let Some(hex_id) = persistent_hex {
            state.aliases.insert(hex_id, peer.ephemeral_id.clone());
        }
        state.peers.insert(peer.ephemeral_id.clone(), peer);
    }

    fn store_pairing_secret(&self, id: &str, secret: [u8; 32]) {
        let mut state = self.state();
        let key = state.resolve(id).unwrap_or_else(|| id.to_string());
        state.secrets.insert(key, secret);
    }

    fn paired_peers(&self) -> Vec<PeerIdentity> {
        self.state()
            .peers
            .values()
            .filter(|peer| peer.is_paired())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    #[test]
    fn test_lookup_by_either_id() {
        let remote = LocalIdentity::create("Carol").unwrap();
        let directory = InMemoryDirectory::new();

        let mut peer = PeerIdentity::unpaired(&remote.ephemeral_id(), "Carol").unwrap();
        peer.upgrade_to_paired(remote.persistent_public_key(), None);
        directory.upsert(peer.clone());

        assert_eq!(directory.lookup(&remote.ephemeral_id()), Some(peer.clone()));
        assert_eq!(directory.lookup(&remote.persistent_id()), Some(peer));
        assert_eq!(
            directory.persistent_key_for(&remote.ephemeral_id()),
            Some(remote.persistent_public_key())
        );
    }

    #[test]
    fn test_new_ephemeral_id_replaces_record() {
        let first = LocalIdentity::from_seeds([4u8; 32], [5u8; 32], "Dan").unwrap();
        let second = LocalIdentity::from_seeds([4u8; 32], [6u8; 32], "Dan").unwrap();
        let directory = InMemoryDirectory::new();

        let mut old = PeerIdentity::unpaired(&first.ephemeral_id(), "Dan").unwrap();
        old.upgrade_to_paired(first.persistent_public_key(), None);
        directory.upsert(old);
        directory.store_pairing_secret(&first.ephemeral_id(), [8u8; 32]);
        directory.set_favorite(&first.ephemeral_id(), true);

        let mut new = PeerIdentity::unpaired(&second.ephemeral_id(), "Dan").unwrap();
        new.upgrade_to_paired(second.persistent_public_key(), None);
        directory.upsert(new);

        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.pairing_secret_for(&second.ephemeral_id()),
            Some([8u8; 32])
        );
        assert!(directory.is_favorite(&second.persistent_id()));
        assert!(directory.lookup(&first.ephemeral_id()).is_some());
        assert_eq!(directory.paired_peers().len(), 1);
        assert_eq!(
            directory.paired_peers()[0].ephemeral_id,
            second.ephemeral_id()
        );
    }
}
