//! Peerchat Network — serverless peer discovery and chat sessions.
//!
//! This crate provides the networking layer for peerchat: nodes find each
//! other without a central server and exchange text messages over direct,
//! persistent connections.
//!
//! # Architecture
//!
//! - **Host**: the local identity plus the table of live connections, at most
//!   one per remote peer. WebSocket transport (via `tokio-tungstenite`) with
//!   protocol-tagged streams multiplexed over each connection.
//! - **Discovery**: UDP announcements on the LAN and a Kademlia-style routed
//!   overlay. Both feed the discovery engine, which auto-connects.
//! - **Protocol**: length-prefixed UTF-8 chat frames on `/chat/1.0.0`
//!   streams, with send and receive session loops.
//! - **Sessions**: outbound send sessions and the inbound chat handler.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use peerchat_network::{ChatNode, NetworkConfig, PeerAddress};
//! use peerchat_network::identity::NodeIdentity;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = NodeIdentity::generate("my-node");
//! let mut node = ChatNode::new(identity, NetworkConfig::default());
//! let mut inbox = node.take_inbox().expect("inbox");
//!
//! node.start().await?;
//! let peer: PeerAddress = "6f1c1a7e-3b52-4c8e-9d43-0d7f3c2a9b10@192.168.1.20:9470".parse()?;
//! let session = node.open_session(&peer).await?;
//! session.send("hello").await?;
//!
//! while let Some(event) = inbox.recv().await {
//!     println!("{event:?}");
//! }
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod host;
pub mod identity;
pub mod node;
pub mod peer;
mod persist;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod session;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use address::PeerAddress;
pub use config::{CHAT_PROTOCOL_ID, NetworkConfig, ROUTING_PROTOCOL_ID, SERVICE_TAG};
pub use connection::{Connection, Direction, Stream};
pub use error::{
    ConnectError, DiscoveryError, FramingError, InputError, NetworkError, SessionError,
    StreamError,
};
pub use host::Host;
pub use identity::{NodeIdentity, PeerId};
pub use node::{ChatNode, NodeHandle};
pub use peer::{DiscoveredPeerRecord, DiscoverySource, PeerFound, PeerRegistry};
pub use protocol::{ChatEvent, ChatSession, Role, SessionId, SessionState};
pub use session::{SessionHandle, SessionManager};
