//! Peer registry — every peer discovery has ever reported.
//!
//! Records are created on the first sighting, merged on repeat sightings and
//! never removed while the node runs. A record says nothing about whether a
//! connection to the peer is live; ask the [`Host`](crate::host::Host).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::identity::PeerId;

/// Which discovery mechanism reported a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// UDP announcement on the local segment.
    Local,
    /// Routing-overlay bootstrap or lookup.
    Routed,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Routed => f.write_str("routed"),
        }
    }
}

/// Event sent by a discovery source when it learns of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFound {
    pub peer_id: PeerId,
    pub addrs: Vec<SocketAddr>,
    pub source: DiscoverySource,
}

impl PeerFound {
    /// Dialable addresses for the found peer.
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.addrs
            .iter()
            .map(|addr| PeerAddress::new(self.peer_id.clone(), *addr))
            .collect()
    }
}

/// What we know about one discovered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeerRecord {
    pub peer_id: PeerId,
    /// Every address the peer was reported at, in order of first sighting.
    pub addrs: Vec<SocketAddr>,
    pub sources: BTreeSet<DiscoverySource>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeerRecord {
    /// Dialable addresses for this peer.
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.addrs
            .iter()
            .map(|addr| PeerAddress::new(self.peer_id.clone(), *addr))
            .collect()
    }

    /// Comma-separated source tags, e.g. `local,routed`.
    pub fn source_tags(&self) -> String {
        self.sources
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Outcome of recording a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time this peer was seen.
    New,
    /// Known peer, at least one address or source was added.
    Updated,
    /// Known peer, nothing new.
    Unchanged,
}

/// Registry of all discovered peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, DiscoveredPeerRecord>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting, merging addresses and sources into any existing
    /// record.
    pub fn record(&mut self, found: &PeerFound) -> Sighting {
        let now = Utc::now();
        match self.peers.get_mut(&found.peer_id) {
            Some(record) => {
                record.last_seen = now;
                let mut changed = record.sources.insert(found.source);
                for addr in &found.addrs {
                    if !record.addrs.contains(addr) {
                        record.addrs.push(*addr);
                        changed = true;
                    }
                }
                if changed {
                    Sighting::Updated
                } else {
                    Sighting::Unchanged
                }
            }
            None => {
                let mut addrs = Vec::with_capacity(found.addrs.len());
                for addr in &found.addrs {
                    if !addrs.contains(addr) {
                        addrs.push(*addr);
                    }
                }
                self.peers.insert(
                    found.peer_id.clone(),
                    DiscoveredPeerRecord {
                        peer_id: found.peer_id.clone(),
                        addrs,
                        sources: BTreeSet::from([found.source]),
                        first_seen: now,
                        last_seen: now,
                    },
                );
                Sighting::New
            }
        }
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&DiscoveredPeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// All records, oldest sighting first.
    pub fn list_all(&self) -> Vec<DiscoveredPeerRecord> {
        let mut all: Vec<DiscoveredPeerRecord> = self.peers.values().cloned().collect();
        all.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        all
    }

    /// Return the total number of known peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
