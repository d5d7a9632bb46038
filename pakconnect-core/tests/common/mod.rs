// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common Test Utilities
//!
//! Identities, simulated nodes on an [`InMemoryRadio`], and polling helpers
//! shared across the integration tests.

#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use pakconnect_core::{
    InMemoryDirectory, InMemoryMessageStore, InMemoryRadio, LocalIdentity, MeshNode,
    MeshNodeBuilder, NodeConfig,
};
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic identity; distinct seeds give distinct ids.
pub fn identity(name: &str, seed: u8) -> Arc<LocalIdentity> {
    Arc::new(LocalIdentity::from_seeds([seed; 32], [seed.wrapping_add(128); 32], name).unwrap())
}

/// A node attached to a radio, with its seams kept for inspection.
pub struct TestNode {
    pub address: String,
    pub node: Arc<MeshNode>,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemoryMessageStore>,
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.node_id().to_string()
    }
}

/// Attaches a node to `radio` and spawns its run loop on the current runtime.
pub fn spawn_node(
    radio: &InMemoryRadio,
    address: &str,
    name: &str,
    seed: u8,
    config: NodeConfig,
) -> TestNode {
    spawn_node_with(
        radio,
        address,
        identity(name, seed),
        Arc::new(InMemoryDirectory::new()),
        config,
    )
}

/// Like [`spawn_node`], with a given identity and contact directory; a
/// restarted node keeps its master seed and its contacts.
pub fn spawn_node_with(
    radio: &InMemoryRadio,
    address: &str,
    identity: Arc<LocalIdentity>,
    directory: Arc<InMemoryDirectory>,
    config: NodeConfig,
) -> TestNode {
    let (endpoint, events) = radio.attach(address);
    let store = Arc::new(InMemoryMessageStore::new());
    let node = Arc::new(
        MeshNodeBuilder::new(identity, Arc::new(endpoint))
            .config(config)
            .directory(directory.clone())
            .message_store(store.clone())
            .build()
            .unwrap(),
    );
    tokio::spawn(node.clone().run(events));
    TestNode {
        address: address.to_string(),
        node,
        directory,
        store,
    }
}

/// Polls `condition` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
