// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Next-hop selection among eligible neighbours.

use std::cmp::Ordering;

/// A connected neighbour that could carry a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopCandidate {
    /// Mesh routing id (the neighbour's ephemeral id).
    pub node_id: String,
    /// Id the neighbour is addressed by (persistent id once paired).
    pub addressing_id: String,
    pub link_quality: Option<i16>,
    pub discovered_at: u64,
}

impl NextHopCandidate {
    pub fn new(node_id: &str, discovered_at: u64) -> Self {
        NextHopCandidate {
            node_id: node_id.to_string(),
            addressing_id: node_id.to_string(),
            link_quality: None,
            discovered_at,
        }
    }

    pub fn with_addressing_id(mut self, addressing_id: &str) -> Self {
        self.addressing_id = addressing_id.to_string();
        self
    }

    pub fn with_link_quality(mut self, quality: i16) -> Self {
        self.link_quality = Some(quality);
        self
    }

    /// Returns true if this neighbour is `id`.
    pub fn is(&self, id: &str) -> bool {
        self.node_id == id || self.addressing_id == id
    }
}

/// Tie-break among eligible next hops. Candidates are already filtered
/// (no visited nodes, not the sender, not us).
pub trait NextHopStrategy: Send + Sync {
    fn select<'a>(&self, candidates: &'a [NextHopCandidate]) -> Option<&'a NextHopCandidate>;

    fn name(&self) -> &'static str;
}

/// Earliest-discovered neighbour wins; ties go to the lowest node id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryOrder;

impl NextHopStrategy for DiscoveryOrder {
    fn select<'a>(&self, candidates: &'a [NextHopCandidate]) -> Option<&'a NextHopCandidate> {
        candidates.iter().min_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
    }

    fn name(&self) -> &'static str {
        "discovery-order"
    }
}

/// Best link quality wins; unknown quality ranks last, ties fall back to
/// discovery order and then node id.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrongestLink;

impl NextHopStrategy for StrongestLink {
    fn select<'a>(&self, candidates: &'a [NextHopCandidate]) -> Option<&'a NextHopCandidate> {
        candidates.iter().min_by(|a, b| {
            match (a.link_quality, b.link_quality) {
                (Some(qa), Some(qb)) => qb.cmp(&qa),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then(a.discovered_at.cmp(&b.discovered_at))
            .then_with(|| a.node_id.cmp(&b.node_id))
        })
    }

    fn name(&self) -> &'static str {
        "strongest-link"
    }
}
