use std::net::SocketAddr;
use std::time::Duration;

use peerchat_network::{
    ChatEvent, ChatNode, ConnectError, NetworkConfig, NetworkError, NodeIdentity, PeerAddress,
    PeerId, SessionError, SessionState,
};

fn discovering_config(targets: Vec<SocketAddr>) -> NetworkConfig {
    let mut config = NetworkConfig::loopback();
    config.discovery_enabled = true;
    config.discovery_port = 0;
    config.discovery_interval = Duration::from_millis(100);
    config.announce_targets = targets;
    config
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn next_message(inbox: &mut tokio::sync::mpsc::Receiver<ChatEvent>) -> (PeerId, String) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("message in time")
            .expect("inbox open");
        if let ChatEvent::Message { from, text } = event {
            return (from, text);
        }
    }
}

#[tokio::test]
async fn nodes_discover_connect_and_chat() {
    // A's announcements start with a placeholder target until B's discovery
    // socket exists.
    let mut a = ChatNode::new(
        NodeIdentity::generate("a"),
        discovering_config(vec!["127.0.0.1:9".parse().unwrap()]),
    );
    let mut a_inbox = a.take_inbox().unwrap();
    a.start().await.unwrap();
    let a_discovery = loopback(a.local_discovery().unwrap().local_addr());

    let mut b = ChatNode::new(NodeIdentity::generate("b"), discovering_config(vec![a_discovery]));
    b.start().await.unwrap();
    let b_discovery = loopback(b.local_discovery().unwrap().local_addr());
    a.local_discovery().unwrap().add_target(b_discovery);

    let a_handle = a.handle().unwrap();
    let b_handle = b.handle().unwrap();
    let a_id = a.peer_id().clone();
    let b_id = b.peer_id().clone();

    wait_until("mutual discovery", || {
        a.peers().iter().any(|p| p.peer_id == b_id) && b.peers().iter().any(|p| p.peer_id == a_id)
    })
    .await;
    wait_until("auto-connect", || {
        a_handle.is_connected(&b_id) && b_handle.is_connected(&a_id)
    })
    .await;

    // Let any simultaneous dial settle, then exactly one connection remains.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a_handle.host().connections().len(), 1);
    assert_eq!(b_handle.host().connections().len(), 1);

    let record = a.peers().into_iter().find(|p| p.peer_id == b_id).unwrap();
    assert_eq!(record.source_tags(), "local");

    // B chats with A over the existing connection.
    let dials_before = b_handle.dial_attempts();
    let a_addr = a.local_addresses().remove(0);
    let session = b.open_session(&a_addr).await.unwrap();
    assert_eq!(b_handle.dial_attempts(), dials_before);

    session.send("hello \n").await.unwrap();
    session.send("how are  you?").await.unwrap();

    assert_eq!(next_message(&mut a_inbox).await, (b_id.clone(), "hello".to_string()));
    assert_eq!(
        next_message(&mut a_inbox).await,
        (b_id.clone(), "how are  you?".to_string())
    );

    session.send("exit").await.unwrap();
    assert_eq!(session.close().await, SessionState::Closed);
    assert!(b_handle.is_connected(&a_id));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stopping_a_node_drops_its_connections() {
    let mut a = ChatNode::new(NodeIdentity::generate("a"), NetworkConfig::loopback());
    let mut b = ChatNode::new(NodeIdentity::generate("b"), NetworkConfig::loopback());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let a_addr = a.local_addresses().remove(0);
    let session = b.open_session(&a_addr).await.unwrap();
    let b_handle = b.handle().unwrap();
    assert!(b_handle.is_connected(a.peer_id()));

    let a_id = a.peer_id().clone();
    a.stop().await;
    wait_until("connection teardown", || !b_handle.is_connected(&a_id)).await;

    let state = tokio::time::timeout(Duration::from_secs(2), session.close())
        .await
        .unwrap();
    assert_eq!(state, SessionState::Failed);

    b.stop().await;
}

#[tokio::test]
async fn connecting_to_nothing_reports_refused_or_timeout() {
    let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = vacant.local_addr().unwrap();
    drop(vacant);

    let mut config = NetworkConfig::loopback();
    config.connection_timeout = Duration::from_secs(1);
    let mut node = ChatNode::new(NodeIdentity::generate("lonely"), config);
    node.start().await.unwrap();

    let target = PeerAddress::new(PeerId::generate(), dead);
    match node.open_session(&target).await {
        Err(NetworkError::Session(SessionError::Connect(
            ConnectError::Refused(_) | ConnectError::Timeout(_),
        ))) => {}
        other => panic!("expected Refused or Timeout, got {other:?}"),
    }

    // The node keeps working afterwards.
    assert!(node.is_running());
    assert!(!node.handle().unwrap().is_connected(&target.peer_id));
    node.stop().await;
}
