//! WebSocket transport — dialing, accepting and driving connections.
//!
//! One WebSocket carries one [`Connection`]. Every WebSocket text message is
//! a JSON-encoded [`Frame`]. After the `hello` exchange, two background tasks
//! drive each connection: a writer draining the connection's frame queue into
//! the socket, and a reader dispatching inbound frames to streams and to the
//! protocol router.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, client_async};
use tracing::{debug, trace, warn};

use crate::address::{PeerAddress, resolve_unspecified};
use crate::connection::{Chunk, Connection, Direction, wait_closed};
use crate::error::ConnectError;
use crate::identity::PeerId;
use crate::router::ProtocolRouter;

type WsStream = WebSocketStream<TcpStream>;

/// A unit of the connection-level wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake: the sender's identity and listen addresses.
    Hello {
        peer_id: PeerId,
        listen_addrs: Vec<SocketAddr>,
    },
    /// Open a stream for a protocol.
    Open { stream: u64, protocol: String },
    /// Stream payload bytes.
    Data { stream: u64, data: Vec<u8> },
    /// The sender finished writing on a stream.
    Close { stream: u64 },
    /// The sender refuses to open a stream.
    Reject { stream: u64, reason: String },
    /// The sender aborts a stream.
    Reset { stream: u64, reason: String },
}

impl Frame {
    /// Serialize the frame to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a frame from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Invoked once a connection's reader task has finished.
pub type ClosedHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Local side of the transport: who we are and where inbound streams go.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub local: PeerId,
    pub listen_addrs: Arc<RwLock<Vec<SocketAddr>>>,
    pub router: Arc<RwLock<ProtocolRouter>>,
    pub on_closed: ClosedHook,
}

impl Endpoint {
    fn hello(&self) -> Frame {
        Frame::Hello {
            peer_id: self.local.clone(),
            listen_addrs: self.listen_addrs.read().clone(),
        }
    }
}

/// Dial `target`, perform the handshake and start the connection tasks.
///
/// The caller bounds the whole operation with its connect timeout.
pub(crate) async fn dial(
    endpoint: &Endpoint,
    target: &PeerAddress,
) -> Result<Connection, ConnectError> {
    let tcp = TcpStream::connect(target.addr)
        .await
        .map_err(|e| dial_error(&e, target.addr))?;
    let _ = tcp.set_nodelay(true);

    let url = format!("ws://{}/", target.addr);
    let (mut ws, _) = client_async(url.as_str(), tcp)
        .await
        .map_err(|e| ConnectError::Refused(format!("WebSocket handshake with {}: {e}", target.addr)))?;

    send_frame(&mut ws, &endpoint.hello())
        .await
        .map_err(|e| ConnectError::Unreachable(format!("{}: {e}", target.addr)))?;

    let (peer_id, listen_addrs) = recv_hello(&mut ws, target.addr).await?;
    if peer_id != target.peer_id {
        let _ = ws.send(Message::Close(None)).await;
        return Err(ConnectError::Refused(format!(
            "{} answered as {peer_id}, expected {}",
            target.addr, target.peer_id
        )));
    }

    debug!("Dialed {peer_id} at {}", target.addr);
    Ok(spawn_connection(
        endpoint,
        ws,
        peer_id,
        target.addr,
        listen_addrs,
        Direction::Outbound,
    ))
}

/// Complete the handshake for an accepted TCP stream.
pub(crate) async fn accept(
    endpoint: &Endpoint,
    tcp: TcpStream,
    remote_addr: SocketAddr,
) -> Result<Connection, ConnectError> {
    let _ = tcp.set_nodelay(true);
    let mut ws = accept_async(tcp)
        .await
        .map_err(|e| ConnectError::Refused(format!("WebSocket accept from {remote_addr}: {e}")))?;

    let (peer_id, listen_addrs) = recv_hello(&mut ws, remote_addr).await?;
    if peer_id == endpoint.local {
        let _ = ws.send(Message::Close(None)).await;
        return Err(ConnectError::Refused(format!(
            "{remote_addr} presented our own identity"
        )));
    }

    send_frame(&mut ws, &endpoint.hello())
        .await
        .map_err(|e| ConnectError::Unreachable(format!("{remote_addr}: {e}")))?;

    debug!("Accepted {peer_id} from {remote_addr}");
    Ok(spawn_connection(
        endpoint,
        ws,
        peer_id,
        remote_addr,
        listen_addrs,
        Direction::Inbound,
    ))
}

fn dial_error(err: &std::io::Error, addr: SocketAddr) -> ConnectError {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => ConnectError::Refused(format!("{addr}: {err}")),
        _ => ConnectError::Unreachable(format!("{addr}: {err}")),
    }
}

async fn send_frame(
    ws: &mut WsStream,
    frame: &Frame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = frame
        .to_json()
        .map_err(|e| tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(e)))?;
    ws.send(Message::Text(json.into())).await
}

async fn recv_hello(
    ws: &mut WsStream,
    remote_addr: SocketAddr,
) -> Result<(PeerId, Vec<SocketAddr>), ConnectError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return match Frame::from_json(&text) {
                    Ok(Frame::Hello {
                        peer_id,
                        listen_addrs,
                    }) => {
                        let listen_addrs = listen_addrs
                            .into_iter()
                            .map(|addr| resolve_unspecified(addr, remote_addr.ip()))
                            .collect();
                        Ok((peer_id, listen_addrs))
                    }
                    Ok(other) => Err(ConnectError::Refused(format!(
                        "{remote_addr} sent {other:?} before hello"
                    ))),
                    Err(e) => Err(ConnectError::Refused(format!(
                        "{remote_addr} sent a bad hello: {e}"
                    ))),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectError::Refused(format!(
                    "{remote_addr} closed during handshake"
                )));
            }
            Some(Ok(_)) => {} // Ignore binary/ping/pong
            Some(Err(e)) => {
                return Err(ConnectError::Unreachable(format!("{remote_addr}: {e}")));
            }
        }
    }
}

fn spawn_connection(
    endpoint: &Endpoint,
    ws: WsStream,
    remote_peer: PeerId,
    remote_addr: SocketAddr,
    remote_listen_addrs: Vec<SocketAddr>,
    direction: Direction,
) -> Connection {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let conn = Connection::new(
        endpoint.local.clone(),
        remote_peer,
        remote_addr,
        remote_listen_addrs,
        direction,
        frames_tx,
    );

    let (sink, stream) = ws.split();
    tokio::spawn(write_loop(sink, frames_rx, conn.subscribe_closed()));
    tokio::spawn(read_loop(
        stream,
        conn.clone(),
        Arc::clone(&endpoint.router),
        Arc::clone(&endpoint.on_closed),
    ));
    conn
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    closed: watch::Receiver<bool>,
) {
    let closed = wait_closed(closed);
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match frame.to_json() {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            debug!("Send error: {e}");
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping unserializable frame: {e}"),
                }
            }
            _ = &mut closed => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    conn: Connection,
    router: Arc<RwLock<ProtocolRouter>>,
    on_closed: ClosedHook,
) {
    let closed = wait_closed(conn.subscribe_closed());
    tokio::pin!(closed);

    loop {
        let msg = tokio::select! {
            _ = &mut closed => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                Ok(frame) => handle_frame(&conn, &router, frame),
                Err(e) => warn!("Bad frame from {}: {e}", conn.remote_peer()),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!("{} closed {}", conn.remote_peer(), conn.id());
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Read error from {}: {e}", conn.remote_peer());
                break;
            }
        }
    }

    conn.close();
    on_closed(&conn);
}

fn handle_frame(conn: &Connection, router: &RwLock<ProtocolRouter>, frame: Frame) {
    match frame {
        Frame::Open { stream, protocol } => {
            let handler = router.read().handler(&protocol);
            let Some(handler) = handler else {
                debug!("No handler for {protocol} from {}", conn.remote_peer());
                reject(conn, stream, format!("unsupported protocol {protocol}"));
                return;
            };
            match conn.accept_stream(stream, &protocol) {
                Some(accepted) => {
                    trace!("Inbound {protocol} stream {stream} from {}", conn.remote_peer());
                    tokio::spawn(handler(accepted));
                }
                None => {
                    warn!("Rejected stream id {stream} from {}", conn.remote_peer());
                    reject(conn, stream, "invalid stream id".to_string());
                }
            }
        }
        Frame::Data { stream, data } => conn.deliver(stream, Chunk::Data(data)),
        Frame::Close { stream } => conn.deliver(stream, Chunk::Fin),
        Frame::Reject { stream, reason } => conn.deliver(stream, Chunk::Rejected(reason)),
        Frame::Reset { stream, reason } => conn.deliver(stream, Chunk::Reset(reason)),
        Frame::Hello { .. } => debug!("Ignoring repeated hello from {}", conn.remote_peer()),
    }
}

fn reject(conn: &Connection, stream: u64, reason: String) {
    let _ = conn.send_frame(Frame::Reject { stream, reason });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Open {
            stream: 3,
            protocol: "/chat/1.0.0".to_string(),
        };
        let json = frame.to_json().unwrap();
        assert_eq!(json, r#"{"type":"open","stream":3,"protocol":"/chat/1.0.0"}"#);
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_hello_carries_listen_addrs() {
        let frame = Frame::Hello {
            peer_id: PeerId::generate(),
            listen_addrs: vec!["0.0.0.0:9470".parse().unwrap()],
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""listen_addrs":["0.0.0.0:9470"]"#));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_dial_error_mapping() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let other = std::io::Error::from(std::io::ErrorKind::AddrNotAvailable);
        assert!(matches!(dial_error(&refused, addr), ConnectError::Refused(_)));
        assert!(matches!(dial_error(&other, addr), ConnectError::Unreachable(_)));
    }
}
