//! Peer addresses — a socket address bound to the identity it terminates at.
//!
//! The text form is `<peer-id>@<ip>:<port>`, e.g.
//! `6f9619ff-8b86-d011-b42d-00c04fc964ff@192.168.1.20:9470`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::identity::PeerId;

/// A dialable address for a specific peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }

    /// Parse user input, reporting why it was rejected.
    pub fn parse(input: &str) -> Result<Self, InputError> {
        let trimmed = input.trim();
        let unparsable = |reason: String| InputError::UnparsableAddress {
            input: trimmed.to_string(),
            reason,
        };

        let (id, addr) = trimmed
            .split_once('@')
            .ok_or_else(|| unparsable("expected <peer-id>@<ip>:<port>".to_string()))?;

        let peer_id = id
            .parse::<PeerId>()
            .map_err(|e| unparsable(format!("invalid peer id: {e}")))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| unparsable(format!("invalid socket address: {e}")))?;

        if addr.port() == 0 {
            return Err(unparsable("port must be non-zero".to_string()));
        }

        Ok(Self { peer_id, addr })
    }
}

impl FromStr for PeerAddress {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.addr)
    }
}

/// Replace an unspecified listen IP (`0.0.0.0` / `::`) with the IP the peer
/// was actually observed at.
pub fn resolve_unspecified(addr: SocketAddr, observed: IpAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(observed, addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_address() {
        let id = PeerId::generate();
        let addr = PeerAddress::parse(&format!("{id}@127.0.0.1:9470")).unwrap();
        assert_eq!(addr.peer_id, id);
        assert_eq!(addr.addr, "127.0.0.1:9470".parse().unwrap());
        assert_eq!(addr.to_string(), format!("{id}@127.0.0.1:9470"));
    }

    #[test]
    fn test_parse_ipv6_address() {
        let id = PeerId::generate();
        let addr: PeerAddress = format!("{id}@[::1]:9000").parse().unwrap();
        assert!(addr.addr.is_ipv6());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = PeerAddress::parse("not-an-address").unwrap_err();
        let InputError::UnparsableAddress { input, .. } = err;
        assert_eq!(input, "not-an-address");
    }

    #[test]
    fn test_parse_rejects_bad_parts() {
        let id = PeerId::generate();
        assert!(PeerAddress::parse("bogus@127.0.0.1:9470").is_err());
        assert!(PeerAddress::parse(&format!("{id}@localhost")).is_err());
        assert!(PeerAddress::parse(&format!("{id}@127.0.0.1:0")).is_err());
    }

    #[test]
    fn test_resolve_unspecified() {
        let observed: IpAddr = "192.168.1.7".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:9470".parse().unwrap();
        let concrete: SocketAddr = "10.0.0.2:9470".parse().unwrap();

        assert_eq!(
            resolve_unspecified(wildcard, observed),
            "192.168.1.7:9470".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(resolve_unspecified(concrete, observed), concrete);
    }
}
