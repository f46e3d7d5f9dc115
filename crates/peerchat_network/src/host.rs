//! Host — the local identity plus the table of live connections.
//!
//! Every connect and accept goes through the [`Host`]. The connection table
//! is the only state shared between the discovery engine, the CLI and the
//! accept loop, and every mutation of it happens under one mutex. At most one
//! live [`Connection`] exists per remote identity:
//!
//! - concurrent `connect` calls to the same identity share one dial;
//! - when both ends dial each other at once, the connection dialed by the
//!   lexicographically smaller peer ID wins on both ends and the other is
//!   closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::connection::{Connection, ConnectionId, Stream};
use crate::error::{ConnectError, StreamError};
use crate::identity::{NodeIdentity, PeerId};
use crate::router::{ProtocolRouter, StreamHandler};
use crate::transport::{self, ClosedHook, Endpoint};

type DialOutcome = Option<Result<Connection, ConnectError>>;

enum Slot {
    Live(Connection),
    Dialing(watch::Receiver<DialOutcome>),
}

enum Existing {
    Live(Connection),
    Dialing(watch::Receiver<DialOutcome>),
    Vacant,
}

struct HostInner {
    identity: NodeIdentity,
    connect_timeout: Duration,
    listen_addrs: Arc<RwLock<Vec<SocketAddr>>>,
    router: Arc<RwLock<ProtocolRouter>>,
    table: Mutex<HashMap<PeerId, Slot>>,
    dial_attempts: AtomicU64,
    shut_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

/// Cloneable handle to the local transport host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Create a host for `identity`. Nothing listens until [`Host::listen`].
    pub fn new(identity: NodeIdentity, connect_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(HostInner {
                identity,
                connect_timeout,
                listen_addrs: Arc::new(RwLock::new(Vec::new())),
                router: Arc::new(RwLock::new(ProtocolRouter::new())),
                table: Mutex::new(HashMap::new()),
                dial_attempts: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.identity.peer_id
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }

    /// Addresses the host is listening on.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listen_addrs.read().clone()
    }

    /// Listen addresses in dialable `<peer-id>@<addr>` form.
    pub fn local_addresses(&self) -> Vec<PeerAddress> {
        self.listen_addrs()
            .into_iter()
            .map(|addr| PeerAddress::new(self.peer_id().clone(), addr))
            .collect()
    }

    /// Total number of dials this host has started.
    pub fn dial_attempts(&self) -> u64 {
        self.inner.dial_attempts.load(Ordering::Relaxed)
    }

    /// Register the handler for inbound streams of `protocol`, replacing any
    /// previous one.
    pub fn register_handler(&self, protocol: &str, handler: StreamHandler) {
        if self.inner.router.write().register(protocol, handler).is_some() {
            debug!("Replaced stream handler for {protocol}");
        }
    }

    /// Bind a listener and start accepting connections in the background.
    /// Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        self.inner.listen_addrs.write().push(bound);
        info!("Listening on {bound}");

        let host = self.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            host.accept_loop(listener, shutdown).await;
        });

        Ok(bound)
    }

    /// The live connection to `peer`, if any.
    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        match self.inner.table.lock().get(peer) {
            Some(Slot::Live(conn)) if !conn.is_closed() => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).is_some()
    }

    /// Snapshot of all live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .table
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(conn) if !conn.is_closed() => Some(conn.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connect to `addr`, reusing a live connection to the same identity and
    /// joining a dial already in flight.
    pub async fn connect(&self, addr: &PeerAddress) -> Result<Connection, ConnectError> {
        self.connect_with(addr, true).await
    }

    /// Like [`Host::connect`], but fails with `AlreadyInProgress` instead of
    /// waiting on a dial that is already in flight.
    pub async fn try_connect(&self, addr: &PeerAddress) -> Result<Connection, ConnectError> {
        self.connect_with(addr, false).await
    }

    /// Open a protocol-tagged stream over an existing connection.
    pub fn open_stream(&self, conn: &Connection, protocol: &str) -> Result<Stream, StreamError> {
        conn.open_stream(protocol)
    }

    /// Stop accepting, close every connection and refuse further dials.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());

        let drained: Vec<Slot> = self.inner.table.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            if let Slot::Live(conn) = slot {
                debug!("Closing {} to {}", conn.id(), conn.remote_peer());
                conn.close();
            }
        }
        info!("Host {} shut down", self.peer_id());
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn connect_with(
        &self,
        addr: &PeerAddress,
        wait: bool,
    ) -> Result<Connection, ConnectError> {
        if addr.peer_id == *self.peer_id() {
            return Err(ConnectError::Refused("cannot connect to self".to_string()));
        }
        if self.is_shut_down() {
            return Err(ConnectError::Refused("host is shut down".to_string()));
        }

        let claimed = {
            let mut table = self.inner.table.lock();
            let existing = match table.get(&addr.peer_id) {
                Some(Slot::Live(conn)) if !conn.is_closed() => Existing::Live(conn.clone()),
                Some(Slot::Dialing(rx)) => Existing::Dialing(rx.clone()),
                _ => Existing::Vacant,
            };
            match existing {
                Existing::Live(conn) => return Ok(conn),
                Existing::Dialing(rx) => Err(rx),
                Existing::Vacant => {
                    let (tx, rx) = watch::channel(None);
                    table.insert(addr.peer_id.clone(), Slot::Dialing(rx));
                    Ok(tx)
                }
            }
        };
        let outcome_tx = match claimed {
            Ok(tx) => tx,
            Err(_) if !wait => return Err(ConnectError::AlreadyInProgress),
            Err(rx) => return await_dial(rx).await,
        };

        let guard = DialGuard {
            host: self,
            peer: &addr.peer_id,
        };
        self.inner.dial_attempts.fetch_add(1, Ordering::Relaxed);
        debug!("Dialing {addr}");

        let endpoint = self.endpoint();
        let timeout = self.inner.connect_timeout;
        let result = match tokio::time::timeout(timeout, transport::dial(&endpoint, addr)).await {
            Ok(Ok(conn)) => self.install(conn),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Timeout(timeout)),
        };
        drop(guard);

        let _ = outcome_tx.send(Some(result.clone()));
        result
    }

    /// Insert a freshly established connection, resolving duplicates.
    /// Returns the connection that is live for that peer afterwards, or
    /// `Refused` when the host shut down while the channel was set up.
    fn install(&self, conn: Connection) -> Result<Connection, ConnectError> {
        let peer = conn.remote_peer().clone();
        let mut table = self.inner.table.lock();

        if self.is_shut_down() {
            drop(table);
            conn.close();
            return Err(ConnectError::Refused("host is shut down".to_string()));
        }

        let existing = match table.get(&peer) {
            Some(Slot::Live(live)) if !live.is_closed() => Some(live.clone()),
            _ => None,
        };

        let (winner, loser) = match existing {
            Some(live) if live.id() == conn.id() => (live, None),
            Some(live) => {
                if self.prefers(&conn, &live) {
                    table.insert(peer.clone(), Slot::Live(conn.clone()));
                    (conn, Some(live))
                } else {
                    (live, Some(conn))
                }
            }
            None => {
                table.insert(peer.clone(), Slot::Live(conn.clone()));
                (conn, None)
            }
        };
        drop(table);

        if let Some(loser) = loser {
            debug!(
                "Duplicate connection to {peer}: keeping {}, closing {}",
                winner.id(),
                loser.id()
            );
            loser.close();
        }
        Ok(winner)
    }

    /// Whether `candidate` should replace `live` as the connection to the
    /// same peer. The connection dialed by the smaller peer ID wins.
    fn prefers(&self, candidate: &Connection, live: &Connection) -> bool {
        let canonical_dialer = std::cmp::min(self.peer_id(), candidate.remote_peer());
        candidate.dialer() == canonical_dialer && live.dialer() != canonical_dialer
    }

    /// Drop `conn` from the table if it is still the registered instance.
    fn forget(&self, peer: &PeerId, id: ConnectionId) {
        let mut table = self.inner.table.lock();
        if matches!(table.get(peer), Some(Slot::Live(live)) if live.id() == id) {
            table.remove(peer);
            debug!("Removed {id} to {peer} from connection table");
        }
    }

    fn endpoint(&self) -> Endpoint {
        let weak = Arc::downgrade(&self.inner);
        let on_closed: ClosedHook = Arc::new(move |conn: &Connection| {
            if let Some(inner) = weak.upgrade() {
                Host { inner }.forget(conn.remote_peer(), conn.id());
            }
        });

        Endpoint {
            local: self.peer_id().clone(),
            listen_addrs: Arc::clone(&self.inner.listen_addrs),
            router: Arc::clone(&self.inner.router),
            on_closed,
        }
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        let endpoint = self.endpoint();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, remote_addr)) => {
                            let host = self.clone();
                            let endpoint = endpoint.clone();
                            tokio::spawn(async move {
                                let timeout = host.inner.connect_timeout;
                                match tokio::time::timeout(
                                    timeout,
                                    transport::accept(&endpoint, tcp, remote_addr),
                                )
                                .await
                                {
                                    Ok(Ok(conn)) => {
                                        let peer = conn.remote_peer().clone();
                                        match host.install(conn) {
                                            Ok(live) => debug!("Inbound connection from {peer} ({})", live.id()),
                                            Err(e) => debug!("Dropped inbound connection from {peer}: {e}"),
                                        }
                                    }
                                    Ok(Err(e)) => warn!("Inbound handshake from {remote_addr} failed: {e}"),
                                    Err(_) => warn!("Inbound handshake from {remote_addr} timed out"),
                                }
                            });
                        }
                        Err(e) => warn!("TCP accept failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Clears the `Dialing` slot if the dial ends without installing a
/// connection, including when the connecting future is dropped.
struct DialGuard<'a> {
    host: &'a Host,
    peer: &'a PeerId,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.host.inner.table.lock();
        if matches!(table.get(self.peer), Some(Slot::Dialing(_))) {
            table.remove(self.peer);
        }
    }
}

async fn await_dial(mut rx: watch::Receiver<DialOutcome>) -> Result<Connection, ConnectError> {
    loop {
        let outcome = rx.borrow_and_update().clone();
        if let Some(result) = outcome {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(ConnectError::Unreachable("dial was abandoned".to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::stream_handler;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listening_host(name: &str) -> (Host, PeerAddress) {
        let host = Host::new(NodeIdentity::generate(name), Duration::from_secs(2));
        let bound = host.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = PeerAddress::new(host.peer_id().clone(), bound);
        (host, addr)
    }

    #[tokio::test]
    async fn test_connection_established_after_shutdown_is_refused() {
        use crate::connection::Direction;

        let host = Host::new(NodeIdentity::generate("a"), Duration::from_secs(2));
        host.shutdown();

        let (frames, _frames_rx) = tokio::sync::mpsc::unbounded_channel();
        let late = Connection::new(
            host.peer_id().clone(),
            PeerId::generate(),
            "127.0.0.1:9".parse().unwrap(),
            Vec::new(),
            Direction::Outbound,
            frames,
        );
        match host.install(late.clone()) {
            Err(ConnectError::Refused(reason)) => assert_eq!(reason, "host is shut down"),
            Err(e) => panic!("Expected Refused, got {e}"),
            Ok(_) => panic!("Expected Refused, got a connection"),
        }
        assert!(late.is_closed());
        assert!(host.connections().is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_echo_stream() {
        let (server, server_addr) = listening_host("server").await;
        server.register_handler(
            "/echo/1.0.0",
            stream_handler(|mut stream| async move {
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                }
            }),
        );

        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));
        let conn = client.connect(&server_addr).await.unwrap();
        assert_eq!(conn.remote_peer(), server.peer_id());

        let stream = client.open_stream(&conn, "/echo/1.0.0").unwrap();
        let (mut reader, mut writer) = stream.split();
        writer.write_all(b"ping pong").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping pong");

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let (server, server_addr) = listening_host("server").await;
        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));

        let attempts = (0..8).map(|_| {
            let client = client.clone();
            let addr = server_addr.clone();
            tokio::spawn(async move { client.connect(&addr).await })
        });
        let results = futures::future::join_all(attempts).await;

        let ids: Vec<ConnectionId> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().id())
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(client.dial_attempts(), 1);
        assert_eq!(client.connections().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connections().len(), 1);

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_reuses_live_connection() {
        let (server, server_addr) = listening_host("server").await;
        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));

        let first = client.connect(&server_addr).await.unwrap();
        let second = client.try_connect(&server_addr).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(client.dial_attempts(), 1);

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_refused_when_nothing_listens() {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let free = vacant.local_addr().unwrap();
        drop(vacant);

        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));
        let target = PeerAddress::new(PeerId::generate(), free);
        let err = client.connect(&target).await.unwrap_err();
        assert!(
            matches!(err, ConnectError::Refused(_) | ConnectError::Unreachable(_)),
            "unexpected error: {err:?}"
        );
        assert!(!client.is_connected(&target.peer_id));
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_listener() {
        // Accepts TCP but never speaks WebSocket.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let _keep = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = silent.accept().await {
                held.push(tcp);
            }
        });

        let client = Host::new(NodeIdentity::generate("client"), Duration::from_millis(200));
        let target = PeerAddress::new(PeerId::generate(), addr);
        let err = client.connect(&target).await.unwrap_err();
        assert_eq!(err, ConnectError::Timeout(Duration::from_millis(200)));

        // The dialing slot was released, so a new attempt dials again.
        let _ = client.connect(&target).await;
        assert_eq!(client.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn test_wrong_identity_is_refused() {
        let (server, server_addr) = listening_host("server").await;
        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));

        let wrong = PeerAddress::new(PeerId::generate(), server_addr.addr);
        let err = client.connect(&wrong).await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused(_)));

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_self_refused() {
        let (host, addr) = listening_host("solo").await;
        assert!(matches!(
            host.connect(&addr).await,
            Err(ConnectError::Refused(_))
        ));
        assert_eq!(host.dial_attempts(), 0);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_unregistered_protocol_is_rejected() {
        let (server, server_addr) = listening_host("server").await;
        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));
        let conn = client.connect(&server_addr).await.unwrap();

        let mut stream = conn.open_stream("/nope/1.0.0").unwrap();
        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_remote_close_unblocks_streams_and_clears_table() {
        let (server, server_addr) = listening_host("server").await;
        server.register_handler(
            "/hold/1.0.0",
            stream_handler(|stream| async move {
                // Keep the stream open without writing.
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(stream);
            }),
        );

        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));
        let conn = client.connect(&server_addr).await.unwrap();
        let mut stream = conn.open_stream("/hold/1.0.0").unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            stream.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read should unblock")
            .unwrap();
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::ConnectionAborted
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_connected(server.peer_id()));
        client.shutdown();
    }

    #[tokio::test]
    async fn test_simultaneous_dial_converges_on_one_connection() {
        let (a, a_addr) = listening_host("a").await;
        let (b, b_addr) = listening_host("b").await;

        let (ra, rb) = tokio::join!(a.connect(&b_addr), b.connect(&a_addr));
        assert!(ra.is_ok() && rb.is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let a_conn = a.connection(b.peer_id()).expect("a keeps a connection");
        let b_conn = b.connection(a.peer_id()).expect("b keeps a connection");
        let smaller = std::cmp::min(a.peer_id(), b.peer_id());
        assert_eq!(a_conn.dialer(), smaller);
        assert_eq!(b_conn.dialer(), smaller);
        assert_eq!(a.connections().len(), 1);
        assert_eq!(b.connections().len(), 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_dials() {
        let (server, server_addr) = listening_host("server").await;
        let client = Host::new(NodeIdentity::generate("client"), Duration::from_secs(2));
        client.shutdown();

        assert!(matches!(
            client.connect(&server_addr).await,
            Err(ConnectError::Refused(_))
        ));
        server.shutdown();
    }
}
