//! Session manager — binds chat sessions to streams.
//!
//! Inbound chat streams are handed to the receive loop by the handler
//! registered in [`SessionManager::register`]. Outbound sessions are opened
//! with [`SessionManager::open_session`], which returns a [`SessionHandle`]
//! that feeds user lines to the send loop.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::config::CHAT_PROTOCOL_ID;
use crate::connection::{Connection, Stream};
use crate::error::{SessionError, StreamError};
use crate::host::Host;
use crate::identity::PeerId;
use crate::protocol::{
    ChatEvent, ChatSession, Outgoing, Role, SessionId, SessionState, await_remote_close, check_len,
    prepare_line, receive_loop, send_loop,
};
use crate::router::stream_handler;

/// Lines buffered between the input loop and a send session.
const OUTGOING_BUFFER: usize = 64;

/// Opens outbound chat sessions and serves inbound ones.
#[derive(Clone)]
pub struct SessionManager {
    host: Host,
    inbox: mpsc::Sender<ChatEvent>,
    max_message_len: usize,
}

impl SessionManager {
    pub fn new(host: Host, inbox: mpsc::Sender<ChatEvent>, max_message_len: usize) -> Self {
        Self {
            host,
            inbox,
            max_message_len,
        }
    }

    /// Register the chat handler: every accepted chat stream runs the
    /// receive loop and reports its messages to the inbox.
    pub fn register(&self) {
        let inbox = self.inbox.clone();
        let max_len = self.max_message_len;
        self.host.register_handler(
            CHAT_PROTOCOL_ID,
            stream_handler(move |stream| serve_inbound(stream, max_len, inbox.clone())),
        );
    }

    /// Connect to `addr` and open a chat session over the connection.
    pub async fn open_session(&self, addr: &PeerAddress) -> Result<SessionHandle, SessionError> {
        let conn = self.host.connect(addr).await?;
        self.start_session(&conn)
    }

    /// Open a chat session over an existing connection.
    ///
    /// The session ends when the local user exits, when the remote finishes
    /// or resets its side of the stream, or when the connection drops.
    pub fn start_session(&self, conn: &Connection) -> Result<SessionHandle, SessionError> {
        let stream = self.host.open_stream(conn, CHAT_PROTOCOL_ID)?;
        let peer = stream.remote_peer().clone();
        let (lines_tx, mut lines_rx) = mpsc::channel(OUTGOING_BUFFER);
        let inbox = self.inbox.clone();
        let conn = conn.clone();
        let max_len = self.max_message_len;
        let mut session = ChatSession::new(peer.clone(), Role::Initiator);
        let id = session.id();

        info!("Chat session {id} opened with {peer}");
        let task = tokio::spawn(async move {
            let (mut reader, mut writer) = stream.split();
            let result = tokio::select! {
                result = send_loop(&mut writer, &mut session, &mut lines_rx, max_len) => result,
                result = await_remote_close(&mut reader) => result,
                _ = conn.closed() => Err(SessionError::Stream(StreamError::ConnectionClosed)),
            };
            match result {
                Ok(()) => session.close(),
                Err(_) => session.fail(),
            }
            // Refuse further lines before anyone hears the session ended.
            drop(lines_rx);
            finish(&session, result, &inbox).await
        });

        Ok(SessionHandle {
            id,
            peer,
            max_len,
            lines: lines_tx,
            task,
        })
    }
}

/// Handle to an outbound chat session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    peer: PeerId,
    max_len: usize,
    lines: mpsc::Sender<String>,
    task: JoinHandle<SessionState>,
}

impl SessionHandle {
    /// Matches the `session` of the [`ChatEvent::SessionEnded`] this
    /// session reports.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer on the other end.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queue one line of user input. The exit sentinel ends the session.
    ///
    /// A line longer than the message limit is refused here and the session
    /// carries on.
    pub async fn send(&self, line: impl Into<String>) -> Result<(), SessionError> {
        let line = line.into();
        if let Outgoing::Message(text) = prepare_line(&line) {
            check_len(text.len(), self.max_len)?;
        }
        self.lines
            .send(line)
            .await
            .map_err(|_| SessionError::Stream(StreamError::ConnectionClosed))
    }

    /// Whether the send loop has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// End the session and wait for its final state.
    pub async fn close(self) -> SessionState {
        drop(self.lines);
        self.task.await.unwrap_or(SessionState::Failed)
    }
}

async fn serve_inbound(mut stream: Stream, max_len: usize, inbox: mpsc::Sender<ChatEvent>) {
    let peer = stream.remote_peer().clone();
    debug!("Inbound chat stream {} from {peer}", stream.id());
    let mut session = ChatSession::new(peer, Role::Responder);
    let result = receive_loop(&mut stream, &mut session, max_len, &inbox).await;
    if let Err(e) = &result {
        stream.reset(e.to_string());
    }
    finish(&session, result, &inbox).await;
}

/// Log the outcome of a session and report it to the inbox.
async fn finish(
    session: &ChatSession,
    result: Result<(), SessionError>,
    inbox: &mpsc::Sender<ChatEvent>,
) -> SessionState {
    let reason = match &result {
        Ok(()) => {
            debug!("Chat {} with {} closed", session.id(), session.peer());
            None
        }
        Err(e) => {
            warn!("Chat {} with {} failed: {e}", session.id(), session.peer());
            Some(e.to_string())
        }
    };
    let _ = inbox
        .send(ChatEvent::SessionEnded {
            session: session.id(),
            peer: session.peer().clone(),
            role: session.role(),
            state: session.state(),
            reason,
        })
        .await;
    session.state()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::FramingError;
    use crate::identity::NodeIdentity;

    struct Side {
        host: Host,
        sessions: SessionManager,
        inbox: mpsc::Receiver<ChatEvent>,
    }

    async fn side(name: &str) -> (Side, PeerAddress) {
        side_with_limit(name, 64 * 1024).await
    }

    async fn side_with_limit(name: &str, max_len: usize) -> (Side, PeerAddress) {
        let host = Host::new(NodeIdentity::generate(name), Duration::from_secs(2));
        let (tx, rx) = mpsc::channel(32);
        let sessions = SessionManager::new(host.clone(), tx, max_len);
        sessions.register();
        let bound = host.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = PeerAddress::new(host.peer_id().clone(), bound);
        (
            Side {
                host,
                sessions,
                inbox: rx,
            },
            addr,
        )
    }

    async fn next_event(inbox: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("event in time")
            .expect("inbox open")
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order_and_trimmed() {
        let (mut a, a_addr) = side("a").await;
        let (b, _) = side("b").await;

        let handle = b.sessions.open_session(&a_addr).await.unwrap();
        assert_eq!(handle.peer(), a.host.peer_id());
        handle.send("hello \n").await.unwrap();
        handle.send("second message").await.unwrap();

        let from_b = b.host.peer_id().clone();
        assert_eq!(
            next_event(&mut a.inbox).await,
            ChatEvent::Message { from: from_b.clone(), text: "hello".into() }
        );
        assert_eq!(
            next_event(&mut a.inbox).await,
            ChatEvent::Message { from: from_b.clone(), text: "second message".into() }
        );

        // `exit` closes the session but not the connection.
        handle.send("exit").await.unwrap();
        match next_event(&mut a.inbox).await {
            ChatEvent::SessionEnded { peer, role, state, reason, .. } => {
                assert_eq!(peer, from_b);
                assert_eq!(role, Role::Responder);
                assert_eq!(state, SessionState::Closed);
                assert!(reason.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.close().await, SessionState::Closed);
        assert!(b.host.is_connected(a.host.peer_id()));

        a.host.shutdown();
        b.host.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_line_is_refused_and_session_continues() {
        let (mut a, a_addr) = side("a").await;
        let (b, _) = side("b").await;

        let handle = b.sessions.open_session(&a_addr).await.unwrap();
        let err = handle.send("x".repeat(70 * 1024)).await.unwrap_err();
        assert!(matches!(err, SessionError::Framing(FramingError::Malformed(_))));

        handle.send("after").await.unwrap();
        assert_eq!(
            next_event(&mut a.inbox).await,
            ChatEvent::Message { from: b.host.peer_id().clone(), text: "after".into() }
        );
        assert!(!handle.is_finished());

        a.host.shutdown();
        b.host.shutdown();
    }

    #[tokio::test]
    async fn test_responder_reset_ends_the_initiator_session() {
        let (mut a, a_addr) = side_with_limit("a", 16).await;
        let (mut b, _) = side("b").await;

        let handle = b.sessions.open_session(&a_addr).await.unwrap();
        let id = handle.id();
        handle.send("a".repeat(32)).await.unwrap();

        match next_event(&mut a.inbox).await {
            ChatEvent::SessionEnded { role, state, reason, .. } => {
                assert_eq!(role, Role::Responder);
                assert_eq!(state, SessionState::Failed);
                assert!(reason.unwrap().contains("exceeds"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut b.inbox).await {
            ChatEvent::SessionEnded { session, role, state, reason, .. } => {
                assert_eq!(session, id);
                assert_eq!(role, Role::Initiator);
                assert_eq!(state, SessionState::Failed);
                assert!(reason.unwrap().contains("reset"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The initiator learns about it instead of sending into the void.
        assert!(handle.send("after").await.is_err());
        assert!(b.host.is_connected(a.host.peer_id()));
        let state = tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .unwrap();
        assert_eq!(state, SessionState::Failed);

        a.host.shutdown();
        b.host.shutdown();
    }

    #[tokio::test]
    async fn test_connection_loss_fails_the_session() {
        let (a, a_addr) = side("a").await;
        let (b, _) = side("b").await;

        let handle = b.sessions.open_session(&a_addr).await.unwrap();
        a.host.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!b.host.is_connected(a.host.peer_id()));

        let state = tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .unwrap();
        assert_eq!(state, SessionState::Failed);

        b.host.shutdown();
    }

    #[tokio::test]
    async fn test_open_session_to_nothing_fails_with_connect_error() {
        let (b, _) = side("b").await;
        let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = vacant.local_addr().unwrap();
        drop(vacant);

        let err = b
            .sessions
            .open_session(&PeerAddress::new(PeerId::generate(), dead))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        b.host.shutdown();
    }
}
