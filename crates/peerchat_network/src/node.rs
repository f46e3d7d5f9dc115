//! ChatNode — top-level coordinator for the chat networking layer.
//!
//! [`ChatNode`] is the primary public API for peerchat_network. It manages:
//! - The transport host (listener plus the connection table)
//! - Local discovery (UDP announcements on the LAN)
//! - Routed discovery (bootstrap, lookups and periodic refresh)
//! - The discovery engine (auto-connect on `PeerFound`)
//! - Chat sessions (inbound receive loops, outbound send sessions)

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::address::PeerAddress;
use crate::config::NetworkConfig;
use crate::discovery::{Announcement, LocalDiscovery, LocalDiscoveryConfig};
use crate::engine::DiscoveryEngine;
use crate::error::NetworkError;
use crate::host::Host;
use crate::identity::{NodeIdentity, PeerId};
use crate::peer::{DiscoveredPeerRecord, PeerRegistry};
use crate::protocol::ChatEvent;
use crate::routing::{RoutedDiscovery, RoutedDiscoveryConfig, RoutingPeer};
use crate::session::{SessionHandle, SessionManager};

/// Capacity of the chat inbox channel.
const INBOX_CAPACITY: usize = 256;

/// Capacity of the discovery event channel.
const DISCOVERY_CAPACITY: usize = 256;

/// Cloneable handle to the services of a running node, for use from tasks.
#[derive(Clone)]
pub struct NodeHandle {
    host: Host,
    sessions: SessionManager,
    routed: RoutedDiscovery,
    registry: Arc<RwLock<PeerRegistry>>,
}

impl NodeHandle {
    pub fn peer_id(&self) -> &PeerId {
        self.host.peer_id()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Dialable addresses of this node.
    pub fn local_addresses(&self) -> Vec<PeerAddress> {
        self.host.local_addresses()
    }

    /// Connect (or reuse the connection) to `addr` and open a chat session.
    pub async fn open_session(&self, addr: &PeerAddress) -> Result<SessionHandle, NetworkError> {
        Ok(self.sessions.open_session(addr).await?)
    }

    /// Look a peer up through the routing overlay.
    pub async fn find_peer(&self, peer: &PeerId) -> Option<RoutingPeer> {
        self.routed.find_peer(peer).await
    }

    /// Snapshot of every discovered peer, oldest first.
    pub fn peers(&self) -> Vec<DiscoveredPeerRecord> {
        self.registry.read().list_all()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.host.is_connected(peer)
    }

    /// Peers held in the routing table.
    pub fn routing_table_len(&self) -> usize {
        self.routed.table_len()
    }

    pub fn dial_attempts(&self) -> u64 {
        self.host.dial_attempts()
    }
}

/// The top-level chat node.
///
/// Create one per application instance. Call [`start()`](ChatNode::start) to
/// begin accepting connections and discovering peers. A stopped node cannot
/// be started again.
pub struct ChatNode {
    /// Our identity on the network.
    identity: NodeIdentity,
    /// Network configuration.
    config: NetworkConfig,
    /// Registry of discovered peers.
    registry: Arc<RwLock<PeerRegistry>>,
    /// Sender side of the chat inbox, shared by every session.
    inbox_tx: mpsc::Sender<ChatEvent>,
    inbox_rx: Option<mpsc::Receiver<ChatEvent>>,
    /// Services, present while running.
    handle: Option<NodeHandle>,
    local_discovery: Option<LocalDiscovery>,
    /// Shutdown signal broadcaster.
    shutdown_tx: Option<broadcast::Sender<()>>,
    stopped: bool,
}

impl ChatNode {
    /// Create a new node with the given identity and config.
    pub fn new(identity: NodeIdentity, config: NetworkConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            identity,
            config,
            registry: Arc::new(RwLock::new(PeerRegistry::new())),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            handle: None,
            local_discovery: None,
            shutdown_tx: None,
            stopped: false,
        }
    }

    /// Create a node with a fresh identity and default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        let identity = NodeIdentity::generate(name);
        Self::new(identity, NetworkConfig::default())
    }

    /// Return the node's peer ID.
    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    /// Return the node's full identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Whether the node is currently running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Take the chat inbox. Returns `None` after the first call.
    pub fn take_inbox(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.inbox_rx.take()
    }

    /// Handle to the running node's services.
    pub fn handle(&self) -> Result<NodeHandle, NetworkError> {
        self.handle.clone().ok_or(NetworkError::NotRunning)
    }

    /// Dialable addresses of this node; empty until started.
    pub fn local_addresses(&self) -> Vec<PeerAddress> {
        self.handle
            .as_ref()
            .map(NodeHandle::local_addresses)
            .unwrap_or_default()
    }

    /// The running local discovery source, if enabled and started.
    pub fn local_discovery(&self) -> Option<&LocalDiscovery> {
        self.local_discovery.as_ref()
    }

    /// Snapshot of every discovered peer.
    pub fn peers(&self) -> Vec<DiscoveredPeerRecord> {
        self.registry.read().list_all()
    }

    /// Connect to `addr` and open a chat session.
    pub async fn open_session(&self, addr: &PeerAddress) -> Result<SessionHandle, NetworkError> {
        self.handle()?.open_session(addr).await
    }

    /// Look a peer up through the routing overlay.
    pub async fn find_peer(&self, peer: &PeerId) -> Result<Option<RoutingPeer>, NetworkError> {
        Ok(self.handle()?.find_peer(peer).await)
    }

    /// Start the node: register protocol handlers, listen, then start the
    /// discovery sources and the engine.
    ///
    /// Fails when the listener cannot be bound, or when routed discovery is
    /// required and its bootstrap fails. Otherwise a bootstrap failure only
    /// disables routed discovery.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }
        if self.stopped {
            return Err(NetworkError::Transport("node was stopped".to_string()));
        }

        let (shutdown_tx, _) = broadcast::channel(8);
        let host = Host::new(self.identity.clone(), self.config.connection_timeout);
        let (found_tx, found_rx) = mpsc::channel(DISCOVERY_CAPACITY);

        // Handlers are registered before the listener accepts anything.
        let sessions = SessionManager::new(
            host.clone(),
            self.inbox_tx.clone(),
            self.config.max_message_len,
        );
        sessions.register();

        let seeds = self.parse_seeds();
        let routed = RoutedDiscovery::new(
            host.clone(),
            RoutedDiscoveryConfig {
                seeds: seeds.clone(),
                bucket_size: self.config.routing_bucket_size,
                refresh_interval: self.config.routing_refresh_interval,
            },
            found_tx.clone(),
        );
        routed.register();

        let listen_addr = self.config.listen_addr;
        host.listen(listen_addr)
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to bind {listen_addr}: {e}")))?;

        DiscoveryEngine::new(host.clone(), Arc::clone(&self.registry))
            .spawn(found_rx, shutdown_tx.subscribe());

        // Start LAN discovery if enabled.
        if self.config.discovery_enabled {
            let discovery_config = LocalDiscoveryConfig {
                port: self.config.discovery_port,
                interval: self.config.discovery_interval,
                targets: self.config.effective_announce_targets(),
                announce_ttl: self.config.announce_ttl,
                announcement: Announcement::new(&self.identity, host.listen_addrs()),
            };
            match LocalDiscovery::start(discovery_config, found_tx.clone(), shutdown_tx.subscribe())
                .await
            {
                Ok(local) => self.local_discovery = Some(local),
                Err(e) => warn!("Local discovery start failed (non-fatal): {e}"),
            }
        }

        // Routed discovery.
        if !seeds.is_empty() || self.config.require_routed_discovery {
            match routed.bootstrap().await {
                Ok(known) => info!("Routed discovery active ({known} peers known)"),
                Err(e) if self.config.require_routed_discovery => {
                    let _ = shutdown_tx.send(());
                    host.shutdown();
                    self.local_discovery = None;
                    return Err(e.into());
                }
                Err(e) => warn!("{e}; continuing with local discovery only"),
            }
            routed.spawn_refresh(shutdown_tx.subscribe());
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(NodeHandle {
            host,
            sessions,
            routed,
            registry: Arc::clone(&self.registry),
        });

        info!(
            "ChatNode '{}' started (peer_id: {})",
            self.identity.name, self.identity.peer_id
        );
        Ok(())
    }

    /// Stop the node: signal every background task and close every
    /// connection.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.host.shutdown();
            self.stopped = true;
        }
        self.local_discovery = None;
        info!("ChatNode '{}' stopped", self.identity.name);
    }

    fn parse_seeds(&self) -> Vec<PeerAddress> {
        self.config
            .seed_peers
            .iter()
            .filter_map(|text| match PeerAddress::parse(text) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring seed peer: {e}");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;

    fn loopback_node(name: &str) -> ChatNode {
        ChatNode::new(NodeIdentity::generate(name), NetworkConfig::loopback())
    }

    #[test]
    fn test_node_creation() {
        let node = ChatNode::with_defaults("test-node");
        assert!(!node.is_running());
        assert_eq!(node.identity().name, "test-node");
        assert!(node.local_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let mut node = loopback_node("lifecycle-node");

        node.start().await.unwrap();
        assert!(node.is_running());
        let addrs = node.local_addresses();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id, *node.peer_id());
        assert_ne!(addrs[0].addr.port(), 0);
        assert!(node.peers().is_empty());

        node.stop().await;
        assert!(!node.is_running());
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_node_double_start() {
        let mut node = loopback_node("double-start-node");

        node.start().await.unwrap();
        // Starting again should be a no-op, not an error.
        node.start().await.unwrap();
        assert!(node.is_running());

        node.stop().await;
    }

    #[tokio::test]
    async fn test_operations_when_not_running() {
        let node = loopback_node("stopped-node");
        let target = PeerAddress::parse(&format!("{}@127.0.0.1:9", PeerId::generate())).unwrap();

        assert!(matches!(
            node.open_session(&target).await,
            Err(NetworkError::NotRunning)
        ));
        assert!(matches!(
            node.find_peer(&PeerId::generate()).await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let mut first = loopback_node("first");
        first.start().await.unwrap();
        let taken = first.local_addresses()[0].addr;

        let mut config = NetworkConfig::loopback();
        config.listen_addr = taken;
        let mut second = ChatNode::new(NodeIdentity::generate("second"), config);
        assert!(matches!(
            second.start().await,
            Err(NetworkError::Transport(_))
        ));

        first.stop().await;
    }

    #[tokio::test]
    async fn test_required_bootstrap_failure_is_fatal() {
        let mut config = NetworkConfig::loopback();
        config.require_routed_discovery = true;
        let mut node = ChatNode::new(NodeIdentity::generate("strict"), config);

        assert!(matches!(
            node.start().await,
            Err(NetworkError::Discovery(DiscoveryError::BootstrapFailed(_)))
        ));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_optional_bootstrap_failure_degrades() {
        let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = vacant.local_addr().unwrap();
        drop(vacant);

        let mut config = NetworkConfig::loopback();
        config.seed_peers = vec![
            format!("{}@{dead}", PeerId::generate()),
            "not-an-address".to_string(),
        ];
        let mut node = ChatNode::new(NodeIdentity::generate("lenient"), config);

        node.start().await.unwrap();
        assert!(node.is_running());
        assert_eq!(node.handle().unwrap().routing_table_len(), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_inbox_taken_once() {
        let mut node = loopback_node("inbox");
        assert!(node.take_inbox().is_some());
        assert!(node.take_inbox().is_none());
    }
}
