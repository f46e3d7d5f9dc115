//! Discovery engine — turns discovery sightings into connection attempts.
//!
//! Both discovery sources feed one mpsc channel of [`PeerFound`] events. The
//! engine records every sighting in the [`PeerRegistry`] and, unless the host
//! already holds a live connection to that identity, starts a background
//! connect. A failed connect is logged and the peer stays discoverable.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConnectError;
use crate::host::Host;
use crate::peer::{PeerFound, PeerRegistry, Sighting};

/// Consumes [`PeerFound`] events and drives auto-connect.
#[derive(Clone)]
pub struct DiscoveryEngine {
    host: Host,
    registry: Arc<RwLock<PeerRegistry>>,
}

impl DiscoveryEngine {
    pub fn new(host: Host, registry: Arc<RwLock<PeerRegistry>>) -> Self {
        Self { host, registry }
    }

    /// Run the engine until the channel closes or shutdown is signalled.
    pub fn spawn(
        self,
        mut found_rx: mpsc::Receiver<PeerFound>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    found = found_rx.recv() => match found {
                        Some(found) => {
                            self.handle_found(found);
                        }
                        None => break,
                    },
                    _ = shutdown.recv() => {
                        debug!("Discovery engine shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Record one sighting and start a connect attempt when needed.
    ///
    /// Returns the attempt's task, or `None` when no attempt was made.
    pub fn handle_found(&self, found: PeerFound) -> Option<JoinHandle<()>> {
        if found.peer_id == *self.host.peer_id() {
            return None;
        }

        let sighting = self.registry.write().record(&found);
        if sighting == Sighting::New {
            info!(
                "Discovered peer {} via {} at {:?}",
                found.peer_id, found.source, found.addrs
            );
        }

        if self.host.is_connected(&found.peer_id) {
            debug!("Already connected to {}; nothing to do", found.peer_id);
            return None;
        }
        if self.host.is_shut_down() {
            return None;
        }

        let host = self.host.clone();
        Some(tokio::spawn(async move {
            connect_any(&host, &found).await;
        }))
    }
}

/// Try each address of `found` in turn until one connects.
async fn connect_any(host: &Host, found: &PeerFound) {
    for addr in found.addresses() {
        match host.try_connect(&addr).await {
            Ok(conn) => {
                info!("Connected to discovered peer {} ({})", found.peer_id, conn.id());
                return;
            }
            Err(ConnectError::AlreadyInProgress) => {
                debug!("Connect to {} already in progress", found.peer_id);
                return;
            }
            Err(e) => warn!("Auto-connect to {addr} failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
