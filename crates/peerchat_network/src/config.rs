//! Network configuration for a chat node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NetworkError;
use crate::persist::{load_json, save_json};

/// Fixed protocol identifier for chat streams.
pub const CHAT_PROTOCOL_ID: &str = "/chat/1.0.0";

/// Fixed protocol identifier for routing-overlay queries.
pub const ROUTING_PROTOCOL_ID: &str = "/chat/kad/1.0.0";

/// Service tag carried by local discovery announcements.
pub const SERVICE_TAG: &str = "p2p-chat-service";

/// Configuration for the chat networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Human-readable node name used for a freshly generated identity.
    pub node_name: String,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// Interval between local discovery announcements.
    #[serde(with = "duration_serde")]
    pub discovery_interval: Duration,

    /// Where announcements are sent. Empty means the limited broadcast
    /// address on `discovery_port`.
    pub announce_targets: Vec<SocketAddr>,

    /// How long an unchanged announcement is suppressed before it is
    /// reported again.
    #[serde(with = "duration_serde")]
    pub announce_ttl: Duration,

    /// Seed peers (`<peer-id>@<ip>:<port>`) for routed discovery.
    pub seed_peers: Vec<String>,

    /// Treat a routed-discovery bootstrap failure as a fatal startup error.
    pub require_routed_discovery: bool,

    /// Interval between routing table refresh lookups.
    #[serde(with = "duration_serde")]
    pub routing_refresh_interval: Duration,

    /// Maximum entries per routing bucket.
    pub routing_bucket_size: usize,

    /// Timeout for establishing a new connection.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Largest chat message accepted on the wire, in bytes.
    pub max_message_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9470)),
            node_name: "peerchat".to_string(),
            discovery_enabled: true,
            discovery_port: 9471,
            discovery_interval: Duration::from_secs(5),
            announce_targets: Vec::new(),
            announce_ttl: Duration::from_secs(30),
            seed_peers: Vec::new(),
            require_routed_discovery: false,
            routing_refresh_interval: Duration::from_secs(300),
            routing_bucket_size: 20,
            connection_timeout: Duration::from_secs(10),
            max_message_len: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    /// A config suitable for tests and single-host experiments: loopback
    /// listener on an ephemeral port, no discovery.
    pub fn loopback() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_enabled: false,
            ..Self::default()
        }
    }

    /// Resolve the announcement targets, defaulting to LAN broadcast.
    pub fn effective_announce_targets(&self) -> Vec<SocketAddr> {
        if self.announce_targets.is_empty() {
            vec![SocketAddr::from(([255, 255, 255, 255], self.discovery_port))]
        } else {
            self.announce_targets.clone()
        }
    }

    /// Save the config as JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        save_json(path, self)
    }

    /// Load the config, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match load_json(path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("Ignoring config file {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
