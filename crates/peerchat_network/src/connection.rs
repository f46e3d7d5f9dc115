//! Connections and the protocol-tagged streams multiplexed over them.
//!
//! A [`Connection`] is a cheap, cloneable handle. Its read and write halves
//! are driven by background tasks (see [`crate::transport`]); streams talk to
//! those tasks through channels. Closing the connection drops every stream's
//! inbound channel, so pending reads fail with
//! [`StreamError::ConnectionClosed`] instead of hanging.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};

use crate::error::StreamError;
use crate::identity::PeerId;
use crate::transport::Frame;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the underlying transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the remote.
    Outbound,
    /// The remote dialed us.
    Inbound,
}

/// Data handed from the connection reader task to a stream.
#[derive(Debug)]
pub(crate) enum Chunk {
    Data(Vec<u8>),
    /// The remote closed its write half.
    Fin,
    /// The remote refused to open the stream.
    Rejected(String),
    /// The remote aborted the stream.
    Reset(String),
}

struct StreamTable {
    next_id: u64,
    open: HashMap<u64, mpsc::UnboundedSender<Chunk>>,
    closed: bool,
}

struct ConnectionInner {
    id: ConnectionId,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_addr: SocketAddr,
    remote_listen_addrs: Vec<SocketAddr>,
    direction: Direction,
    frames: mpsc::UnboundedSender<Frame>,
    streams: Mutex<StreamTable>,
    closed: watch::Sender<bool>,
}

/// An established channel to one remote peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_addr: SocketAddr,
        remote_listen_addrs: Vec<SocketAddr>,
        direction: Direction,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        // Dialer numbers its streams odd, listener even, so ids never collide.
        let next_id = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };
        let (closed, _) = watch::channel(false);

        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
                local_peer,
                remote_peer,
                remote_addr,
                remote_listen_addrs,
                direction,
                frames,
                streams: Mutex::new(StreamTable {
                    next_id,
                    open: HashMap::new(),
                    closed: false,
                }),
                closed,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.inner.remote_peer
    }

    /// The socket address of the remote end of this channel.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Listen addresses the remote advertised in its handshake.
    pub fn remote_listen_addrs(&self) -> &[SocketAddr] {
        &self.inner.remote_listen_addrs
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The identity that dialed this connection.
    pub fn dialer(&self) -> &PeerId {
        match self.inner.direction {
            Direction::Outbound => &self.inner.local_peer,
            Direction::Inbound => &self.inner.remote_peer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.streams.lock().closed
    }

    /// Open a new outbound stream tagged with `protocol`.
    pub fn open_stream(&self, protocol: &str) -> Result<Stream, StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut table = self.inner.streams.lock();
            if table.closed {
                return Err(StreamError::ConnectionClosed);
            }
            let id = table.next_id;
            table.next_id += 2;
            table.open.insert(id, tx);
            id
        };

        let open = Frame::Open {
            stream: id,
            protocol: protocol.to_string(),
        };
        if self.inner.frames.send(open).is_err() {
            self.inner.streams.lock().open.remove(&id);
            return Err(StreamError::ConnectionClosed);
        }

        Ok(Stream::new(self.clone(), id, protocol, rx))
    }

    /// Close the connection. Every stream bound to it observes
    /// `ConnectionClosed` on its next read or write. Idempotent.
    pub fn close(&self) {
        let open = {
            let mut table = self.inner.streams.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.open)
        };
        drop(open);
        self.inner.closed.send_replace(true);
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        wait_closed(self.inner.closed.subscribe()).await;
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Register a stream the remote opened. `None` when the connection is
    /// closed or the id is not a valid remote-assigned id.
    pub(crate) fn accept_stream(&self, id: u64, protocol: &str) -> Option<Stream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.inner.streams.lock();
            let local_parity = table.next_id % 2 == 1;
            let id_parity = id % 2 == 1;
            if table.closed || id == 0 || local_parity == id_parity || table.open.contains_key(&id)
            {
                return None;
            }
            table.open.insert(id, tx);
        }
        Some(Stream::new(self.clone(), id, protocol, rx))
    }

    /// Route an inbound chunk to its stream.
    pub(crate) fn deliver(&self, id: u64, chunk: Chunk) {
        let mut table = self.inner.streams.lock();
        let terminal = matches!(chunk, Chunk::Fin | Chunk::Rejected(_) | Chunk::Reset(_));
        let sender = if terminal {
            table.open.remove(&id)
        } else {
            table.open.get(&id).cloned()
        };

        match sender {
            Some(tx) => {
                if tx.send(chunk).is_err() && !terminal {
                    // Local reader is gone.
                    table.open.remove(&id);
                }
            }
            None => tracing::trace!("Dropping chunk for unknown stream {id} on {}", self.id()),
        }
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), StreamError> {
        self.inner
            .frames
            .send(frame)
            .map_err(|_| StreamError::ConnectionClosed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolve once the watched flag turns `true` or its sender is dropped.
pub(crate) async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// An ordered, reliable byte stream over a [`Connection`], tagged with a
/// protocol identifier.
pub struct Stream {
    id: u64,
    protocol: String,
    remote_peer: PeerId,
    remote_addr: SocketAddr,
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    fn new(conn: Connection, id: u64, protocol: &str, rx: mpsc::UnboundedReceiver<Chunk>) -> Self {
        Self {
            id,
            protocol: protocol.to_string(),
            remote_peer: conn.remote_peer().clone(),
            remote_addr: conn.remote_addr(),
            reader: StreamReader {
                rx,
                buf: Vec::new(),
                pos: 0,
                eof: false,
                failed: None,
            },
            writer: StreamWriter {
                id,
                conn,
                shutdown: false,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Abort the stream, telling the remote why. No close follows.
    pub fn reset(&mut self, reason: impl Into<String>) {
        self.writer.reset(reason);
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Read half of a [`Stream`].
pub struct StreamReader {
    rx: mpsc::UnboundedReceiver<Chunk>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    failed: Option<StreamError>,
}

impl AsyncRead for StreamReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.pos < this.buf.len() {
                let n = buf.remaining().min(this.buf.len() - this.pos);
                buf.put_slice(&this.buf[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            if let Some(err) = &this.failed {
                return Poll::Ready(Err(err.clone().into()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Chunk::Data(data))) => {
                    this.buf = data;
                    this.pos = 0;
                }
                Poll::Ready(Some(Chunk::Fin)) => this.eof = true,
                Poll::Ready(Some(Chunk::Rejected(reason))) => {
                    this.failed = Some(StreamError::ProtocolRejected(reason));
                }
                Poll::Ready(Some(Chunk::Reset(reason))) => {
                    this.failed = Some(StreamError::Reset(reason));
                }
                Poll::Ready(None) => this.failed = Some(StreamError::ConnectionClosed),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Write half of a [`Stream`]. Dropping it half-closes the stream.
pub struct StreamWriter {
    id: u64,
    conn: Connection,
    shutdown: bool,
}

impl StreamWriter {
    /// Abort the stream, telling the remote why. No close follows.
    pub fn reset(&mut self, reason: impl Into<String>) {
        if !self.shutdown {
            self.shutdown = true;
            let _ = self.conn.send_frame(Frame::Reset {
                stream: self.id,
                reason: reason.into(),
            });
        }
    }

    fn finish(&mut self) {
        if !self.shutdown {
            self.shutdown = true;
            let _ = self.conn.send_frame(Frame::Close { stream: self.id });
        }
    }
}

impl AsyncWrite for StreamWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after stream shutdown",
            )));
        }
        if self.conn.is_closed() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let frame = Frame::Data {
            stream: self.id,
            data: buf.to_vec(),
        };
        match self.conn.send_frame(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.conn.is_closed() {
            return Poll::Ready(Err(StreamError::ConnectionClosed.into()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.finish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_conn(direction: Direction) -> (Connection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            PeerId::generate(),
            PeerId::generate(),
            "127.0.0.1:9470".parse().unwrap(),
            Vec::new(),
            direction,
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn test_stream_ids_by_direction() {
        let (outbound, _rx) = make_conn(Direction::Outbound);
        assert_eq!(outbound.open_stream("/p").unwrap().id(), 1);
        assert_eq!(outbound.open_stream("/p").unwrap().id(), 3);

        let (inbound, _rx2) = make_conn(Direction::Inbound);
        assert_eq!(inbound.open_stream("/p").unwrap().id(), 2);
    }

    #[test]
    fn test_accept_stream_rejects_own_parity() {
        let (conn, _rx) = make_conn(Direction::Outbound);
        assert!(conn.accept_stream(1, "/p").is_none());
        assert!(conn.accept_stream(2, "/p").is_some());
        assert!(conn.accept_stream(2, "/p").is_none());
    }

    #[test]
    fn test_open_stream_after_close_fails() {
        let (conn, _rx) = make_conn(Direction::Outbound);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(
            conn.open_stream("/p").err(),
            Some(StreamError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_write_emits_frames_and_close_on_drop() {
        let (conn, mut frames) = make_conn(Direction::Outbound);
        let mut stream = conn.open_stream("/chat/1.0.0").unwrap();
        stream.write_all(b"hi").await.unwrap();
        drop(stream);

        assert!(matches!(frames.recv().await, Some(Frame::Open { stream: 1, .. })));
        match frames.recv().await {
            Some(Frame::Data { stream: 1, data }) => assert_eq!(data, b"hi"),
            other => panic!("Expected data frame, got {other:?}"),
        }
        assert!(matches!(frames.recv().await, Some(Frame::Close { stream: 1 })));
    }

    #[tokio::test]
    async fn test_read_delivered_chunks_then_eof() {
        let (conn, _frames) = make_conn(Direction::Inbound);
        let mut stream = conn.accept_stream(1, "/p").unwrap();

        conn.deliver(1, Chunk::Data(b"hel".to_vec()));
        conn.deliver(1, Chunk::Data(b"lo".to_vec()));
        conn.deliver(1, Chunk::Fin);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (conn, _frames) = make_conn(Direction::Outbound);
        let stream = conn.open_stream("/p").unwrap();
        let (mut reader, mut writer) = stream.split();

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should unblock")
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        let write_err = writer.write_all(b"late").await.unwrap_err();
        assert_eq!(write_err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_protocol_rejected() {
        let (conn, _frames) = make_conn(Direction::Outbound);
        let mut stream = conn.open_stream("/unknown").unwrap();
        conn.deliver(1, Chunk::Rejected("unsupported protocol".into()));

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_remote_reset_fails_reads() {
        let (conn, _frames) = make_conn(Direction::Outbound);
        let mut stream = conn.open_stream("/p").unwrap();
        conn.deliver(1, Chunk::Reset("gave up".into()));

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_local_reset_sends_reset_and_no_close() {
        let (conn, mut frames) = make_conn(Direction::Outbound);
        let mut stream = conn.open_stream("/p").unwrap();
        stream.reset("bad input");
        drop(stream);
        drop(conn);

        assert!(matches!(frames.recv().await, Some(Frame::Open { .. })));
        match frames.recv().await {
            Some(Frame::Reset { stream: 1, reason }) => assert_eq!(reason, "bad input"),
            other => panic!("Expected reset frame, got {other:?}"),
        }
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (conn, _frames) = make_conn(Direction::Outbound);
        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        conn.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
