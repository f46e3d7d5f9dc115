//! LAN peer discovery via UDP broadcast.
//!
//! [`LocalDiscovery`] periodically sends an announcement packet to its
//! targets (the limited broadcast address by default) and listens for
//! announcements from other peers. New or changed peers are reported as
//! [`PeerFound`] events through an mpsc channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::resolve_unspecified;
use crate::config::SERVICE_TAG;
use crate::error::DiscoveryError;
use crate::identity::{NodeIdentity, PeerId};
use crate::peer::{DiscoverySource, PeerFound};

/// Largest UDP payload, so an announcement is never cut short on receipt.
const MAX_DATAGRAM_LEN: usize = 65_535;

/// An announcement broadcast by a peer on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Service tag; announcements for other services are ignored.
    pub service: String,
    /// The peer's unique ID.
    pub peer_id: PeerId,
    /// Addresses the peer accepts connections on. Unspecified IPs are
    /// replaced by the packet's source IP on receipt.
    pub listen_addrs: Vec<SocketAddr>,
    /// Human-readable node name.
    pub name: String,
    /// Software version.
    pub version: String,
}

impl Announcement {
    pub fn new(identity: &NodeIdentity, listen_addrs: Vec<SocketAddr>) -> Self {
        Self {
            service: SERVICE_TAG.to_string(),
            peer_id: identity.peer_id.clone(),
            listen_addrs,
            name: identity.name.clone(),
            version: identity.version.clone(),
        }
    }
}

/// Decides which received announcements become [`PeerFound`] events.
///
/// Drops our own announcements and foreign service tags. A repeat
/// announcement with the same address set is suppressed until `ttl` has
/// passed since it was last reported.
#[derive(Debug)]
pub struct AnnouncementFilter {
    local: PeerId,
    ttl: Duration,
    reported: HashMap<PeerId, (Vec<SocketAddr>, Instant)>,
}

impl AnnouncementFilter {
    pub fn new(local: PeerId, ttl: Duration) -> Self {
        Self {
            local,
            ttl,
            reported: HashMap::new(),
        }
    }

    /// Process one announcement received from `source` at `now`.
    pub fn observe(
        &mut self,
        announcement: Announcement,
        source: SocketAddr,
        now: Instant,
    ) -> Option<PeerFound> {
        if announcement.service != SERVICE_TAG {
            trace!("Ignoring announcement for service '{}'", announcement.service);
            return None;
        }
        if announcement.peer_id == self.local {
            return None;
        }

        let mut addrs: Vec<SocketAddr> = announcement
            .listen_addrs
            .iter()
            .map(|addr| resolve_unspecified(*addr, source.ip()))
            .filter(|addr| addr.port() != 0)
            .collect();
        addrs.sort();
        addrs.dedup();
        if addrs.is_empty() {
            debug!("Announcement from {source} carries no usable address");
            return None;
        }

        if let Some((known, reported_at)) = self.reported.get(&announcement.peer_id) {
            if *known == addrs && now.duration_since(*reported_at) < self.ttl {
                return None;
            }
        }

        self.reported
            .insert(announcement.peer_id.clone(), (addrs.clone(), now));
        Some(PeerFound {
            peer_id: announcement.peer_id,
            addrs,
            source: DiscoverySource::Local,
        })
    }
}

/// Configuration for the local discovery source.
#[derive(Debug, Clone)]
pub struct LocalDiscoveryConfig {
    /// UDP port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// How often to send an announcement.
    pub interval: Duration,
    /// Where announcements are sent.
    pub targets: Vec<SocketAddr>,
    /// Re-report window for unchanged announcements.
    pub announce_ttl: Duration,
    /// Our own announcement.
    pub announcement: Announcement,
}

/// Handle to a running local discovery source.
#[derive(Debug, Clone)]
pub struct LocalDiscovery {
    local_addr: SocketAddr,
    targets: Arc<RwLock<Vec<SocketAddr>>>,
}

impl LocalDiscovery {
    /// Start the discovery source in the background.
    ///
    /// Spawns two tasks:
    /// 1. An announcer that sends our announcement to every target at the
    ///    configured interval, starting immediately.
    /// 2. A listener that filters incoming announcements and forwards new
    ///    sightings through `found_tx`.
    ///
    /// Both tasks exit when the shutdown signal is received.
    pub async fn start(
        config: LocalDiscoveryConfig,
        found_tx: mpsc::Sender<PeerFound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, DiscoveryError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener_socket = UdpSocket::bind(bind_addr).await?;
        listener_socket.set_broadcast(true)?;
        let local_addr = listener_socket.local_addr()?;
        info!("Local discovery listening on {local_addr}");

        let sender_socket = UdpSocket::bind("0.0.0.0:0").await?;
        sender_socket.set_broadcast(true)?;

        let announcement_bytes = serde_json::to_vec(&config.announcement)
            .map_err(|e| DiscoveryError::Socket(std::io::Error::other(e)))?;
        let targets = Arc::new(RwLock::new(config.targets));

        // Announcer.
        let announce_targets = Arc::clone(&targets);
        let mut shutdown_announce = shutdown.resubscribe();
        let interval = config.interval;
        tokio::spawn(async move {
            let mut delay = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        delay = jittered(interval);
                        let targets = announce_targets.read().clone();
                        for target in targets {
                            match sender_socket.send_to(&announcement_bytes, target).await {
                                Ok(_) => trace!("Announcement sent to {target}"),
                                Err(e) => debug!("Announcement to {target} failed: {e}"),
                            }
                        }
                    }
                    _ = shutdown_announce.recv() => {
                        debug!("Discovery announcer shutting down");
                        break;
                    }
                }
            }
        });

        // Listener.
        let mut filter =
            AnnouncementFilter::new(config.announcement.peer_id.clone(), config.announce_ttl);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    result = listener_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src_addr)) => {
                                let announcement = match serde_json::from_slice::<Announcement>(&buf[..len]) {
                                    Ok(announcement) => announcement,
                                    Err(e) => {
                                        debug!("Ignoring {len} byte datagram from {src_addr}: {e}");
                                        continue;
                                    }
                                };
                                let name = announcement.name.clone();
                                if let Some(found) = filter.observe(announcement, src_addr, Instant::now()) {
                                    debug!("Discovered peer '{name}' ({}) at {:?}", found.peer_id, found.addrs);
                                    if found_tx.send(found).await.is_err() {
                                        debug!("Discovery consumer gone; listener stopping");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Discovery recv error: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            targets,
        })
    }

    /// Address the listener socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Also announce to `target` from the next tick on.
    pub fn add_target(&self, target: SocketAddr) {
        let mut targets = self.targets.write();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
}

/// `interval` plus up to 10% random jitter, so nodes started together do
/// not announce in lockstep.
fn jittered(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() / 10) as u64;
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
