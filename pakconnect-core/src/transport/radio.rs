// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory radio for tests and simulation.
//!
//! Nodes attach to a shared [`InMemoryRadio`] and get a [`RadioEndpoint`]
//! (their [`Transport`]) plus the receiving end of their event feed. Two
//! nodes can connect only while placed in range of each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::{ConnectionState, Transport, TransportError, TransportEvent, TransportResult};

type Pair = (String, String);

fn pair(a: &str, b: &str) -> Pair {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Default)]
struct RadioState {
    feeds: HashMap<String, UnboundedSender<TransportEvent>>,
    in_range: HashMap<Pair, Option<i16>>,
    connected: HashSet<Pair>,
    failing_writes: HashSet<(String, String)>,
    writes: u64,
}

impl RadioState {
    fn notify(&self, node: &str, event: TransportEvent) -> bool {
        match self.feeds.get(node) {
            Some(feed) => feed.send(event).is_ok(),
            None => false,
        }
    }
}

/// Shared medium connecting simulated nodes.
#[derive(Clone)]
pub struct InMemoryRadio {
    state: Arc<Mutex<RadioState>>,
    mtu: usize,
}

impl InMemoryRadio {
    pub fn new(mtu: usize) -> Self {
        InMemoryRadio {
            state: Arc::new(Mutex::new(RadioState::default())),
            mtu,
        }
    }

    fn state(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attaches a node and returns its transport and inbound event feed.
    pub fn attach(&self, node: &str) -> (RadioEndpoint, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().feeds.insert(node.to_string(), tx);
        (
            RadioEndpoint {
                node: node.to_string(),
                radio: self.clone(),
            },
            rx,
        )
    }

    /// Places two nodes within radio range.
    pub fn place_in_range(&self, a: &str, b: &str, link_quality: Option<i16>) {
        self.state().in_range.insert(pair(a, b), link_quality);
    }

    /// Moves two nodes apart, dropping any connection between them.
    pub fn move_out_of_range(&self, a: &str, b: &str) {
        let mut state = self.state();
        let key = pair(a, b);
        state.in_range.remove(&key);
        if state.connected.remove(&key) {
            state.notify(a, TransportEvent::Disconnected {
                link_id: b.to_string(),
            });
            state.notify(b, TransportEvent::Disconnected {
                link_id: a.to_string(),
            });
        }
    }

    /// Makes writes from `from` to `to` fail (or succeed again).
    pub fn set_write_failure(&self, from: &str, to: &str, failing: bool) {
        let key = (from.to_string(), to.to_string());
        let mut state = self.state();
        if failing {
            state.failing_writes.insert(key);
        } else {
            state.failing_writes.remove(&key);
        }
    }

    /// Total successful chunk writes across the radio.
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }
}

/// One node's view of the radio.
pub struct RadioEndpoint {
    node: String,
    radio: InMemoryRadio,
}

impl RadioEndpoint {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Transport for RadioEndpoint {
    fn connect(&self, link_id: &str) -> TransportResult<usize> {
        let mut state = self.radio.state();
        let key = pair(&self.node, link_id);
        if !state.in_range.contains_key(&key) {
            return Err(TransportError::Unreachable(link_id.to_string()));
        }
        if state.connected.insert(key) {
            state.notify(
                link_id,
                TransportEvent::Connected {
                    link_id: self.node.clone(),
                    mtu: self.radio.mtu,
                },
            );
            debug!(from = %self.node, to = %link_id, "Radio link connected");
        }
        Ok(self.radio.mtu)
    }

    fn disconnect(&self, link_id: &str) -> TransportResult<()> {
        let mut state = self.radio.state();
        if state.connected.remove(&pair(&self.node, link_id)) {
            state.notify(
                link_id,
                TransportEvent::Disconnected {
                    link_id: self.node.clone(),
                },
            );
        }
        Ok(())
    }

    fn state(&self, link_id: &str) -> ConnectionState {
        if self.radio.state().connected.contains(&pair(&self.node, link_id)) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn write(&self, link_id: &str, bytes: &[u8]) -> TransportResult<()> {
        let mut state = self.radio.state();
        if !state.connected.contains(&pair(&self.node, link_id)) {
            return Err(TransportError::NotConnected(link_id.to_string()));
        }
        if state
            .failing_writes
            .contains(&(self.node.clone(), link_id.to_string()))
        {
            return Err(TransportError::WriteFailed {
                peer: link_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let delivered = state.notify(
            link_id,
            TransportEvent::Data {
                link_id: self.node.clone(),
                bytes: bytes.to_vec(),
            },
        );
        if !delivered {
            return Err(TransportError::WriteFailed {
                peer: link_id.to_string(),
                reason: "peer detached".to_string(),
            });
        }
        state.writes += 1;
        Ok(())
    }

    fn mtu(&self, link_id: &str) -> Option<usize> {
        match self.state(link_id) {
            ConnectionState::Connected => Some(self.radio.mtu),
            _ => None,
        }
    }

    fn link_quality(&self, link_id: &str) -> Option<i16> {
        self.radio
            .state()
            .in_range
            .get(&pair(&self.node, link_id))
            .copied()
            .flatten()
    }
}
