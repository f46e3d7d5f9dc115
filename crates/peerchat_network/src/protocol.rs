//! Chat protocol — message framing and the per-stream session loops.
//!
//! Every message is one frame: a little-endian `u32` byte length followed by
//! that many bytes of UTF-8 text. Content is carried verbatim, so spaces,
//! newlines and any other byte sequence round-trip exactly.
//!
//! A stream carries one [`ChatSession`]. The receive loop reads frames and
//! delivers them to the inbox as [`ChatEvent`]s; the send loop turns user
//! lines into frames. Both end the session without touching the connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{FramingError, SessionError};
use crate::identity::PeerId;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Line that ends a send session.
pub const EXIT_SENTINEL: &str = "exit";

/// Reject a payload of `len` bytes when it exceeds `max_len`.
pub fn check_len(len: usize, max_len: usize) -> Result<(), FramingError> {
    if len > max_len {
        return Err(FramingError::Malformed(format!(
            "frame of {len} bytes exceeds the {max_len} byte limit"
        )));
    }
    Ok(())
}

/// Encode `text` as a single frame of at most `max_len` payload bytes.
pub fn encode_frame(text: &str, max_len: usize) -> Result<Vec<u8>, FramingError> {
    check_len(text.len(), max_len)?;
    let len = u32::try_from(text.len()).map_err(|_| {
        FramingError::Malformed(format!("{} bytes do not fit a frame header", text.len()))
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + text.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

/// Write one message frame and flush. Nothing is written when `text` is
/// over the limit.
pub async fn write_message<W>(writer: &mut W, text: &str, max_len: usize) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(text, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message frame.
///
/// Returns `Ok(None)` on a clean end-of-stream before the first byte of a
/// frame. A stream that ends inside a frame is [`FramingError::Truncated`];
/// nothing of the partial frame is returned.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Option<String>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < LENGTH_PREFIX_LEN {
        return Err(FramingError::Truncated {
            expected: LENGTH_PREFIX_LEN,
            got,
        }
        .into());
    }

    let len = u32::from_le_bytes(header) as usize;
    check_len(len, max_len)?;

    let mut body = vec![0u8; len];
    let got = read_full(reader, &mut body).await?;
    if got < len {
        return Err(FramingError::Truncated { expected: len, got }.into());
    }

    String::from_utf8(body)
        .map(Some)
        .map_err(|e| SessionError::from(FramingError::Malformed(format!("invalid UTF-8: {e}"))))
}

/// Wait until the remote finishes its side of the stream, discarding any
/// bytes it sends. Errors when the stream is reset or the connection drops.
pub async fn await_remote_close<R>(reader: &mut R) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        if reader.read(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Fill `buf` unless the stream ends first. Returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// What a line of user input means to a send session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing<'a> {
    /// Text to send, trailing whitespace removed.
    Message(&'a str),
    /// The exit sentinel.
    Exit,
    /// Nothing left after trimming.
    Empty,
}

/// Classify a raw input line.
pub fn prepare_line(line: &str) -> Outgoing<'_> {
    let text = line.trim_end();
    if text == EXIT_SENTINEL {
        Outgoing::Exit
    } else if text.is_empty() {
        Outgoing::Empty
    } else {
        Outgoing::Message(text)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle state of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream established, nothing exchanged yet.
    Open,
    /// At least one message exchanged.
    Active,
    /// Ended by end-of-stream or by the local user.
    Closed,
    /// Ended by a framing or transport error.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// State of one stream-scoped conversation. Terminal states are sticky.
#[derive(Debug, Clone)]
pub struct ChatSession {
    id: SessionId,
    peer: PeerId,
    role: Role,
    state: SessionState,
}

impl ChatSession {
    pub fn new(peer: PeerId, role: Role) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            peer,
            role,
            state: SessionState::Open,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Open → Active.
    pub fn activate(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Active;
        }
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Closed;
        }
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
    }
}

/// Event delivered to the local chat inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message received from `from`.
    Message { from: PeerId, text: String },
    /// A session with `peer` reached a terminal state.
    SessionEnded {
        session: SessionId,
        peer: PeerId,
        role: Role,
        state: SessionState,
        reason: Option<String>,
    },
}

/// Read frames until end-of-stream or error, delivering each message to
/// `inbox` tagged with the session's peer.
pub async fn receive_loop<R>(
    reader: &mut R,
    session: &mut ChatSession,
    max_len: usize,
    inbox: &mpsc::Sender<ChatEvent>,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message(reader, max_len).await {
            Ok(Some(text)) => {
                session.activate();
                trace!("Received {} bytes from {}", text.len(), session.peer());
                let event = ChatEvent::Message {
                    from: session.peer().clone(),
                    text,
                };
                if inbox.send(event).await.is_err() {
                    debug!("Chat inbox closed; ending session with {}", session.peer());
                    session.close();
                    return Ok(());
                }
            }
            Ok(None) => {
                session.close();
                return Ok(());
            }
            Err(e) => {
                session.fail();
                return Err(e);
            }
        }
    }
}

/// Send each line from `lines` as one frame until the exit sentinel or the
/// end of input, then close the write half. A line over `max_len` bytes
/// fails the session before anything of it is written.
pub async fn send_loop<W>(
    writer: &mut W,
    session: &mut ChatSession,
    lines: &mut mpsc::Receiver<String>,
    max_len: usize,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        match prepare_line(&line) {
            Outgoing::Message(text) => {
                if let Err(e) = write_message(writer, text, max_len).await {
                    session.fail();
                    return Err(e);
                }
                session.activate();
            }
            Outgoing::Empty => {}
            Outgoing::Exit => break,
        }
    }

    let result = writer.shutdown().await.map_err(SessionError::from);
    match result {
        Ok(()) => session.close(),
        Err(_) => session.fail(),
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
