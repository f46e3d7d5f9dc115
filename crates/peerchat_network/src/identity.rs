//! Peer identity — unique node identification and persistence.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::NetworkError;
use crate::persist::{load_json, save_json};

/// A unique identifier for a peer node.
///
/// Always the hyphenated text form of a UUID v4. Ordering is lexicographic
/// on that text, which the host uses to break simultaneous-dial ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    /// Parse and normalize a textual peer ID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s.trim())?;
        Ok(Self(uuid.hyphenated().to_string()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The full identity of a chat node on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique peer identifier.
    pub peer_id: PeerId,
    /// Human-readable name for the node (e.g. hostname).
    pub name: String,
    /// Software version string.
    pub version: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::generate(),
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Save the identity as JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        save_json(path, self)
    }

    /// Load the identity stored at `path`. A missing or invalid file yields
    /// a fresh identity, which is written back.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        match load_json::<NodeIdentity>(path) {
            Ok(Some(identity)) if identity.peer_id.as_str().parse::<PeerId>().is_ok() => {
                return identity;
            }
            Ok(Some(identity)) => {
                warn!("Identity file holds invalid peer id '{}'", identity.peer_id)
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring identity file {}: {e}", path.display()),
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().parse::<PeerId>().is_ok());
    }

    #[test]
    fn test_peer_id_parse_normalizes() {
        let id: PeerId = "  6F9619FF-8B86-D011-B42D-00C04FC964FF ".parse().unwrap();
        assert_eq!(id.as_str(), "6f9619ff-8b86-d011-b42d-00c04fc964ff");
        assert!("not-a-peer".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_identity_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = NodeIdentity::generate("persist-test");
        original.save_to_file(&path).unwrap();

        let loaded = NodeIdentity::load_or_generate(&path, "fallback-name");
        assert_eq!(loaded.peer_id, original.peer_id);
        assert_eq!(loaded.name, "persist-test");
    }

    #[test]
    fn test_identity_load_missing_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let identity = NodeIdentity::load_or_generate(&path, "new-node");
        assert_eq!(identity.name, "new-node");
        assert!(path.exists());

        let again = NodeIdentity::load_or_generate(&path, "other-name");
        assert_eq!(again.peer_id, identity.peer_id);
    }

    #[test]
    fn test_identity_with_invalid_peer_id_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(
            &path,
            r#"{"peer_id":"bogus","name":"old","version":"0.0.1"}"#,
        )
        .unwrap();

        let identity = NodeIdentity::load_or_generate(&path, "fresh");
        assert_eq!(identity.name, "fresh");
        assert_ne!(identity.peer_id.as_str(), "bogus");
    }
}
