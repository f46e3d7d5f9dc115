//! Interactive command loop.
//!
//! In command mode each input line is a peer address (start chatting), one
//! of the commands below, or `exit`. While a chat session is in the
//! foreground, lines are sent to the peer, `exit` leaves the session and a
//! command prefixed with `/` still runs. Connects and lookups run in
//! background tasks so the prompt never blocks.

use std::io;
use std::net::{IpAddr, UdpSocket};

use peerchat_network::address::resolve_unspecified;
use peerchat_network::routing::RoutingPeer;
use peerchat_network::{
    ChatEvent, Direction, InputError, NetworkError, NodeHandle, PeerAddress, PeerId, Role,
    SessionError, SessionHandle, SessionState,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HELP: &str = "\
Commands:
  <peer-id>@<ip>:<port>  start chatting with a peer
  connect <address>      same as entering the address
  peers                  list discovered peers
  find <peer-id>         look a peer up through the routing overlay
  help                   show this help
  exit                   quit (or leave the current chat)
While chatting, prefix a command with '/' to run it, e.g. /peers.";

/// One parsed line of command-mode input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(PeerAddress),
    Peers,
    Find(PeerId),
    Help,
    Exit,
    Empty,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Address(#[from] InputError),

    #[error("Invalid peer id '{0}'")]
    PeerId(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// Parse a command-mode line. Anything that is not a known command is
/// treated as a peer address. A leading `/` is optional.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let line = line.strip_prefix('/').unwrap_or(line);
    let mut words = line.split_whitespace();
    match words.next() {
        None => Ok(Command::Empty),
        Some("exit") => Ok(Command::Exit),
        Some("help") => Ok(Command::Help),
        Some("peers") => Ok(Command::Peers),
        Some("connect") => {
            let (Some(addr), None) = (words.next(), words.next()) else {
                return Err(CommandError::Usage("connect <peer-id>@<ip>:<port>"));
            };
            Ok(Command::Connect(PeerAddress::parse(addr)?))
        }
        Some("find") => {
            let (Some(id), None) = (words.next(), words.next()) else {
                return Err(CommandError::Usage("find <peer-id>"));
            };
            id.parse::<PeerId>()
                .map(Command::Find)
                .map_err(|_| CommandError::PeerId(id.to_string()))
        }
        Some(_) => Ok(Command::Connect(PeerAddress::parse(line)?)),
    }
}

/// Results of background work, fed back into the loop.
enum ReplEvent {
    Connected(SessionHandle),
    ConnectFailed {
        target: PeerAddress,
        error: NetworkError,
    },
    Found {
        target: PeerId,
        result: Option<RoutingPeer>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub struct Repl<W> {
    node: NodeHandle,
    out: W,
    foreground: Option<SessionHandle>,
    events_tx: mpsc::UnboundedSender<ReplEvent>,
    events_rx: mpsc::UnboundedReceiver<ReplEvent>,
}

impl<W: AsyncWrite + Unpin> Repl<W> {
    pub fn new(node: NodeHandle, out: W) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            node,
            out,
            foreground: None,
            events_tx,
            events_rx,
        }
    }

    /// Run until `exit` or end of input. Any foreground session is closed
    /// before returning.
    pub async fn run<R>(&mut self, input: R, mut inbox: mpsc::Receiver<ChatEvent>) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.banner().await?;
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("Input closed");
                        break;
                    };
                    if self.handle_line(&line).await? == Flow::Exit {
                        break;
                    }
                }
                Some(event) = inbox.recv() => self.show_chat_event(event).await?,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await?,
            }
        }

        if let Some(session) = self.foreground.take() {
            session.close().await;
        }
        Ok(())
    }

    async fn say(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        self.out.write_all(text.as_ref().as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }

    async fn banner(&mut self) -> io::Result<()> {
        let id = self.node.peer_id().clone();
        let addrs = dialable_addresses(self.node.local_addresses());
        self.say(format!("Peer ID: {id}")).await?;
        self.say("Listening on:").await?;
        for addr in addrs {
            self.say(format!("  {addr}")).await?;
        }
        self.say("Enter a peer address to chat, or 'help'.").await
    }

    async fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        if self.foreground.as_ref().is_some_and(|s| s.is_finished()) {
            if let Some(session) = self.foreground.take() {
                let peer = session.peer().clone();
                let state = session.close().await;
                self.say(format!("Chat with {peer} ended ({state:?})")).await?;
            }
        }

        if let Some(session) = &self.foreground {
            let peer = session.peer().clone();
            let trimmed = line.trim();
            if trimmed == "exit" || trimmed == "/exit" {
                if let Some(session) = self.foreground.take() {
                    // The send loop treats the sentinel as end of session.
                    let _ = session.send("exit").await;
                    session.close().await;
                }
                self.say(format!("Left chat with {peer}")).await?;
            } else if trimmed.starts_with('/') {
                return match parse_command(trimmed) {
                    Ok(command) => self.execute(command).await,
                    Err(e) => {
                        self.say(format!("Error: {e}")).await?;
                        Ok(Flow::Continue)
                    }
                };
            } else {
                match session.send(line).await {
                    Ok(()) => {}
                    Err(e @ SessionError::Framing(_)) => {
                        self.say(format!("Not sent: {e}")).await?;
                    }
                    Err(e) => {
                        self.foreground = None;
                        self.say(format!("Chat with {peer} lost: {e}")).await?;
                    }
                }
            }
            return Ok(Flow::Continue);
        }

        match parse_command(line) {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                self.say(format!("Error: {e}")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn execute(&mut self, command: Command) -> io::Result<Flow> {
        match command {
            Command::Empty => {}
            Command::Exit => return Ok(Flow::Exit),
            Command::Help => self.say(HELP).await?,
            Command::Peers => self.show_peers().await?,
            Command::Connect(target) => {
                self.say(format!("Connecting to {target}...")).await?;
                let node = self.node.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let event = match node.open_session(&target).await {
                        Ok(session) => ReplEvent::Connected(session),
                        Err(error) => ReplEvent::ConnectFailed { target, error },
                    };
                    let _ = events.send(event);
                });
            }
            Command::Find(target) => {
                self.say(format!("Looking up {target}...")).await?;
                let node = self.node.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = node.find_peer(&target).await;
                    let _ = events.send(ReplEvent::Found { target, result });
                });
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_event(&mut self, event: ReplEvent) -> io::Result<()> {
        match event {
            ReplEvent::Connected(session) => {
                let peer = session.peer().clone();
                if let Some(previous) = self.foreground.replace(session) {
                    info!("Replacing foreground chat with {}", previous.peer());
                    tokio::spawn(previous.close());
                }
                self.say(format!("Chatting with {peer}. Type 'exit' to leave."))
                    .await
            }
            ReplEvent::ConnectFailed { target, error } => {
                warn!("Connect to {target} failed: {error}");
                self.say(format!("Could not connect to {target}: {error}"))
                    .await
            }
            ReplEvent::Found { target, result } => match result {
                Some(peer) => {
                    let addrs: Vec<String> =
                        peer.addresses().iter().map(|a| a.to_string()).collect();
                    self.say(format!("Found {target}: {}", addrs.join(", ")))
                        .await
                }
                None => self.say(format!("Peer {target} not found")).await,
            },
        }
    }

    async fn show_chat_event(&mut self, event: ChatEvent) -> io::Result<()> {
        match event {
            ChatEvent::Message { from, text } => self.say(format!("[{from}] {text}")).await,
            ChatEvent::SessionEnded {
                peer,
                role: Role::Responder,
                state,
                reason,
                ..
            } => {
                let suffix = reason.map(|r| format!(": {r}")).unwrap_or_default();
                self.say(format!("* {peer} stopped chatting ({state:?}{suffix})"))
                    .await
            }
            ChatEvent::SessionEnded {
                session,
                peer,
                role: Role::Initiator,
                state,
                reason,
            } => {
                let was_foreground = self.foreground.as_ref().is_some_and(|s| s.id() == session);
                if was_foreground {
                    self.foreground = None;
                }
                match state {
                    SessionState::Failed => {
                        let reason = reason.unwrap_or_else(|| "connection lost".to_string());
                        self.say(format!("Chat with {peer} failed: {reason}")).await
                    }
                    _ if was_foreground => self.say(format!("Chat with {peer} ended")).await,
                    _ => Ok(()),
                }
            }
        }
    }

    async fn show_peers(&mut self) -> io::Result<()> {
        let records = self.node.peers();
        if records.is_empty() {
            self.say("No peers discovered yet").await?;
        }
        for record in records {
            let live = if self.node.is_connected(&record.peer_id) {
                "connected"
            } else {
                "-"
            };
            let addrs: Vec<String> = record.addrs.iter().map(|a| a.to_string()).collect();
            let line = format!(
                "{} [{}] {} {live}",
                record.peer_id,
                record.source_tags(),
                addrs.join(",")
            );
            self.say(line).await?;
        }
        for conn in self.node.host().connections() {
            let direction = match conn.direction() {
                Direction::Outbound => "outbound",
                Direction::Inbound => "inbound",
            };
            let advertised: Vec<String> =
                conn.remote_listen_addrs().iter().map(|a| a.to_string()).collect();
            let line = format!(
                "  {} {direction} via {} (listening on {})",
                conn.remote_peer(),
                conn.remote_addr(),
                advertised.join(",")
            );
            self.say(line).await?;
        }
        let summary = format!(
            "{} connection(s), {} routing entries, {} dial attempt(s)",
            self.node.host().connections().len(),
            self.node.routing_table_len(),
            self.node.dial_attempts()
        );
        self.say(summary).await
    }

    #[cfg(test)]
    fn has_foreground(&self) -> bool {
        self.foreground.is_some()
    }
}

/// Replace unspecified listen IPs with this machine's outbound address so the
/// printed addresses can be pasted on another host.
fn dialable_addresses(addrs: Vec<PeerAddress>) -> Vec<PeerAddress> {
    let Some(ip) = primary_ip() else {
        return addrs;
    };
    addrs
        .into_iter()
        .map(|a| PeerAddress::new(a.peer_id, resolve_unspecified(a.addr, ip)))
        .collect()
}

/// The local IP the OS would route external traffic from. No packet is sent.
fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
