//! Routed discovery — a Kademlia-style overlay for finding peers that local
//! broadcast cannot reach.
//!
//! Peers are placed in a [`RoutingTable`] keyed by the SHA-256 of their
//! peer ID and ordered by XOR distance. Queries travel over streams tagged
//! with [`ROUTING_PROTOCOL_ID`]: a `find_peers` request is answered with the
//! responder's closest known peers, and the responder records the requester
//! so that every node that bootstraps becomes findable itself.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::address::{PeerAddress, resolve_unspecified};
use crate::config::ROUTING_PROTOCOL_ID;
use crate::connection::Stream;
use crate::error::{ConnectError, DiscoveryError, FramingError, SessionError, StreamError};
use crate::host::Host;
use crate::identity::PeerId;
use crate::peer::{DiscoverySource, PeerFound};
use crate::protocol::{read_message, write_message};
use crate::router::stream_handler;

/// Number of parallel queries per lookup round.
pub const LOOKUP_PARALLELISM: usize = 3;

/// Upper bound on lookup rounds.
pub const MAX_LOOKUP_ROUNDS: usize = 8;

/// Largest routing message accepted on the wire.
const MAX_ROUTING_MESSAGE_LEN: usize = 256 * 1024;

const KEY_BITS: usize = 256;

// ---------------------------------------------------------------------------
// Keys and the routing table
// ---------------------------------------------------------------------------

/// Position of a peer in the overlay keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey([u8; 32]);

impl NodeKey {
    pub fn of(peer: &PeerId) -> Self {
        let digest = Sha256::digest(peer.as_str().as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// XOR distance to `other`, comparable as a big-endian integer.
    pub fn distance(&self, other: &NodeKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index of `other` relative to `self`: the position of the
    /// highest differing bit. `None` for the same key.
    pub fn bucket_index(&self, other: &NodeKey) -> Option<usize> {
        let distance = self.distance(other);
        let mut leading_zeros = 0;
        for byte in distance {
            if byte == 0 {
                leading_zeros += 8;
            } else {
                leading_zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        (leading_zeros < KEY_BITS).then(|| KEY_BITS - 1 - leading_zeros)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A peer as exchanged by the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPeer {
    pub peer_id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl RoutingPeer {
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.addrs
            .iter()
            .map(|addr| PeerAddress::new(self.peer_id.clone(), *addr))
            .collect()
    }
}

/// Result of inserting into the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Already present; moved to most-recently-seen, addresses merged.
    Refreshed,
    /// The bucket is full; the newcomer was dropped.
    BucketFull,
    /// The local peer is never stored.
    IsSelf,
}

/// k-bucket routing table. Each bucket keeps least-recently-seen first.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeKey,
    bucket_size: usize,
    buckets: Vec<VecDeque<RoutingPeer>>,
}

impl RoutingTable {
    pub fn new(local: &PeerId, bucket_size: usize) -> Self {
        Self {
            local: NodeKey::of(local),
            bucket_size: bucket_size.max(1),
            buckets: (0..KEY_BITS).map(|_| VecDeque::new()).collect(),
        }
    }

    pub fn insert(&mut self, peer: RoutingPeer) -> InsertOutcome {
        let Some(index) = self.local.bucket_index(&NodeKey::of(&peer.peer_id)) else {
            return InsertOutcome::IsSelf;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.iter().position(|p| p.peer_id == peer.peer_id) {
            if let Some(mut existing) = bucket.remove(pos) {
                for addr in peer.addrs {
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                }
                bucket.push_back(existing);
            }
            return InsertOutcome::Refreshed;
        }

        if bucket.len() >= self.bucket_size {
            return InsertOutcome::BucketFull;
        }
        bucket.push_back(peer);
        InsertOutcome::Added
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<RoutingPeer> {
        let index = self.local.bucket_index(&NodeKey::of(peer))?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.iter().position(|p| p.peer_id == *peer)?;
        bucket.remove(pos)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&RoutingPeer> {
        let index = self.local.bucket_index(&NodeKey::of(peer))?;
        self.buckets[index].iter().find(|p| p.peer_id == *peer)
    }

    /// Up to `count` known peers closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeKey, count: usize) -> Vec<RoutingPeer> {
        let mut all: Vec<(&RoutingPeer, [u8; 32])> = self
            .buckets
            .iter()
            .flatten()
            .map(|p| (p, NodeKey::of(&p.peer_id).distance(target)))
            .collect();
        all.sort_by(|a, b| a.1.cmp(&b.1));
        all.into_iter().take(count).map(|(p, _)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn populated_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingMessage {
    /// Ask for the peers closest to `target`. `origin` is the requester's
    /// own record.
    FindPeers { target: PeerId, origin: RoutingPeer },
    Peers { peers: Vec<RoutingPeer> },
}

// ---------------------------------------------------------------------------
// Routed discovery source
// ---------------------------------------------------------------------------

/// Settings for [`RoutedDiscovery`].
#[derive(Debug, Clone)]
pub struct RoutedDiscoveryConfig {
    pub seeds: Vec<PeerAddress>,
    pub bucket_size: usize,
    pub refresh_interval: Duration,
}

struct RoutedInner {
    host: Host,
    config: RoutedDiscoveryConfig,
    table: Mutex<RoutingTable>,
    found_tx: mpsc::Sender<PeerFound>,
}

/// Handle to the routed discovery source. Cheap to clone.
#[derive(Clone)]
pub struct RoutedDiscovery {
    inner: Arc<RoutedInner>,
}

impl RoutedDiscovery {
    pub fn new(host: Host, config: RoutedDiscoveryConfig, found_tx: mpsc::Sender<PeerFound>) -> Self {
        let table = RoutingTable::new(host.peer_id(), config.bucket_size);
        Self {
            inner: Arc::new(RoutedInner {
                host,
                config,
                table: Mutex::new(table),
                found_tx,
            }),
        }
    }

    /// Register the query handler on the host.
    pub fn register(&self) {
        let weak: Weak<RoutedInner> = Arc::downgrade(&self.inner);
        self.inner.host.register_handler(
            ROUTING_PROTOCOL_ID,
            stream_handler(move |stream| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        RoutedDiscovery { inner }.serve(stream).await;
                    }
                }
            }),
        );
    }

    /// Number of peers in the routing table.
    pub fn table_len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn populated_buckets(&self) -> usize {
        self.inner.table.lock().populated_buckets()
    }

    /// The routing-table entry for `peer`, if any.
    pub fn known(&self, peer: &PeerId) -> Option<RoutingPeer> {
        self.inner.table.lock().get(peer).cloned()
    }

    /// Contact every seed and look ourselves up through them.
    ///
    /// Succeeds when at least one routing bucket ends up populated.
    pub async fn bootstrap(&self) -> Result<usize, DiscoveryError> {
        let seeds = self.inner.config.seeds.clone();
        if seeds.is_empty() {
            return Err(DiscoveryError::BootstrapFailed(
                "no seed peers configured".to_string(),
            ));
        }

        let local = self.inner.host.peer_id().clone();
        let queries = seeds.iter().map(|seed| self.query(seed, &local));
        let results = join_all(queries).await;

        let mut reached = 0;
        for (seed, result) in seeds.iter().zip(results) {
            match result {
                Ok(peers) => {
                    reached += 1;
                    self.observe(RoutingPeer {
                        peer_id: seed.peer_id.clone(),
                        addrs: vec![seed.addr],
                    })
                    .await;
                    for peer in peers {
                        self.observe(peer).await;
                    }
                }
                Err(e) => warn!("Seed {seed} unreachable: {e}"),
            }
        }

        if reached == 0 {
            return Err(DiscoveryError::BootstrapFailed(format!(
                "none of {} seed peers could be reached",
                seeds.len()
            )));
        }

        self.find_peer(&local).await;

        let populated = self.populated_buckets();
        if populated == 0 {
            return Err(DiscoveryError::BootstrapFailed(
                "no routing bucket was populated".to_string(),
            ));
        }
        let known = self.table_len();
        info!("Routing bootstrap complete: {known} peers in {populated} buckets");
        Ok(known)
    }

    /// Iteratively look up `target`, returning its record if the overlay
    /// knows it. Every peer learned along the way is recorded.
    pub async fn find_peer(&self, target: &PeerId) -> Option<RoutingPeer> {
        let target_key = NodeKey::of(target);
        let bucket_size = self.inner.table.lock().bucket_size();
        let mut shortlist = self.inner.table.lock().closest(&target_key, bucket_size);
        let mut queried: HashSet<PeerId> = HashSet::new();
        let local = self.inner.host.peer_id().clone();

        for round in 0..MAX_LOOKUP_ROUNDS {
            if shortlist.iter().any(|p| p.peer_id == *target) && *target != local {
                break;
            }

            let batch: Vec<RoutingPeer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(LOOKUP_PARALLELISM)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            debug!("Lookup {target} round {round}: querying {} peers", batch.len());

            let results = join_all(batch.iter().map(|p| self.query_any(p, target))).await;
            for (peer, result) in batch.iter().zip(results) {
                queried.insert(peer.peer_id.clone());
                match result {
                    Ok(peers) => {
                        for found in peers {
                            self.observe(found.clone()).await;
                            if found.peer_id != local
                                && !shortlist.iter().any(|p| p.peer_id == found.peer_id)
                            {
                                shortlist.push(found);
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Lookup query to {} failed, evicting: {e}", peer.peer_id);
                        self.inner.table.lock().remove(&peer.peer_id);
                    }
                }
            }

            shortlist.sort_by_key(|p| NodeKey::of(&p.peer_id).distance(&target_key));
            shortlist.truncate(bucket_size);
        }

        shortlist
            .into_iter()
            .find(|p| p.peer_id == *target)
            .or_else(|| self.known(target))
    }

    /// Periodically refresh the table: a self-lookup when peers are known,
    /// a new bootstrap when the table has emptied.
    pub fn spawn_refresh(&self, mut shutdown: broadcast::Receiver<()>) {
        let this = self.clone();
        let period = self.inner.config.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.table_len() == 0 {
                            if let Err(e) = this.bootstrap().await {
                                debug!("Routing re-bootstrap failed: {e}");
                            }
                        } else {
                            let local = this.inner.host.peer_id().clone();
                            this.find_peer(&local).await;
                            debug!("Routing refresh: {} peers known", this.table_len());
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Routing refresh shutting down");
                        break;
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn observe(&self, peer: RoutingPeer) {
        if peer.addrs.is_empty() {
            return;
        }
        let outcome = self.inner.table.lock().insert(peer.clone());
        if outcome == InsertOutcome::Added {
            debug!("Routing table learned {}", peer.peer_id);
            let found = PeerFound {
                peer_id: peer.peer_id,
                addrs: peer.addrs,
                source: DiscoverySource::Routed,
            };
            if self.inner.found_tx.send(found).await.is_err() {
                debug!("Discovery consumer gone; routed sighting dropped");
            }
        }
    }

    fn local_record(&self) -> RoutingPeer {
        RoutingPeer {
            peer_id: self.inner.host.peer_id().clone(),
            addrs: self.inner.host.listen_addrs(),
        }
    }

    async fn query_any(
        &self,
        peer: &RoutingPeer,
        target: &PeerId,
    ) -> Result<Vec<RoutingPeer>, SessionError> {
        let mut last_err = None;
        for addr in peer.addresses() {
            match self.query(&addr, target).await {
                Ok(peers) => return Ok(peers),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            SessionError::Connect(ConnectError::Unreachable(format!(
                "{} has no addresses",
                peer.peer_id
            )))
        }))
    }

    /// Send one `find_peers` request to `addr` and wait for the answer.
    async fn query(
        &self,
        addr: &PeerAddress,
        target: &PeerId,
    ) -> Result<Vec<RoutingPeer>, SessionError> {
        let host = &self.inner.host;
        let conn = host.connect(addr).await?;
        let stream = host.open_stream(&conn, ROUTING_PROTOCOL_ID)?;
        let (mut reader, mut writer) = stream.split();

        let request = RoutingMessage::FindPeers {
            target: target.clone(),
            origin: self.local_record(),
        };
        let json = serde_json::to_string(&request)
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        write_message(&mut writer, &json, MAX_ROUTING_MESSAGE_LEN).await?;

        let timeout = host.connect_timeout();
        let reply = tokio::time::timeout(timeout, read_message(&mut reader, MAX_ROUTING_MESSAGE_LEN))
            .await
            .map_err(|_| SessionError::Connect(ConnectError::Timeout(timeout)))??;

        match reply.map(|text| serde_json::from_str::<RoutingMessage>(&text)) {
            Some(Ok(RoutingMessage::Peers { peers })) => Ok(peers),
            Some(Ok(other)) => Err(FramingError::Malformed(format!(
                "unexpected routing reply {other:?}"
            ))
            .into()),
            Some(Err(e)) => Err(FramingError::Malformed(e.to_string()).into()),
            None => Err(StreamError::ConnectionClosed.into()),
        }
    }

    /// Answer `find_peers` requests on an inbound stream until it ends.
    async fn serve(&self, stream: Stream) {
        let remote = stream.remote_peer().clone();
        let remote_ip = stream.remote_addr().ip();
        let (mut reader, mut writer) = stream.split();

        loop {
            let text = match read_message(&mut reader, MAX_ROUTING_MESSAGE_LEN).await {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(e) => {
                    debug!("Routing stream from {remote} failed: {e}");
                    break;
                }
            };

            let (target, origin) = match serde_json::from_str::<RoutingMessage>(&text) {
                Ok(RoutingMessage::FindPeers { target, origin }) => (target, origin),
                Ok(other) => {
                    debug!("Unexpected routing message from {remote}: {other:?}");
                    break;
                }
                Err(e) => {
                    debug!("Bad routing message from {remote}: {e}");
                    break;
                }
            };

            if origin.peer_id == remote {
                let addrs = origin
                    .addrs
                    .iter()
                    .map(|addr| resolve_unspecified(*addr, remote_ip))
                    .collect();
                self.observe(RoutingPeer {
                    peer_id: remote.clone(),
                    addrs,
                })
                .await;
            }

            let peers: Vec<RoutingPeer> = {
                let table = self.inner.table.lock();
                table
                    .closest(&NodeKey::of(&target), table.bucket_size() + 1)
                    .into_iter()
                    .filter(|p| p.peer_id != remote)
                    .take(table.bucket_size())
                    .collect()
            };

            let reply = RoutingMessage::Peers { peers };
            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode routing reply: {e}");
                    break;
                }
            };
            if let Err(e) = write_message(&mut writer, &json, MAX_ROUTING_MESSAGE_LEN).await {
                debug!("Routing reply to {remote} failed: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
