// tests/end_to_end.rs
//! Full-stack tests: two in-process nodes talking over real WebSocket
//! connections on loopback.

use std::sync::Arc;
use std::time::Duration;

use did_node::{NodeConfig, NodeError, SimpleNode};

/// Builds, identifies, and starts a node listening on `port`.
async fn running_node(port: u16) -> Arc<SimpleNode> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = NodeConfig::new("127.0.0.1", port, "/ws");
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(5);

    let node = SimpleNode::new(config);
    let (private_key, did, document) = node.generate_did_document().unwrap();
    node.set_did_info(&private_key, &did, &document).unwrap();
    node.run().await.unwrap();
    Arc::new(node)
}

/// Makes `from` able to resolve `to` (out-of-band document exchange).
async fn introduce(from: &SimpleNode, to: &SimpleNode) -> String {
    let (_, did, document) = to.export_identity().unwrap();
    let cached = from.add_peer_document(&document).await.unwrap();
    assert_eq!(cached, did);
    did
}

async fn recv(node: &SimpleNode) -> (String, String) {
    tokio::time::timeout(Duration::from_secs(5), node.receive_message())
        .await
        .expect("receive timed out")
        .expect("receive failed")
}

#[tokio::test]
async fn test_ping_pong() {
    let alice = running_node(18311).await;
    let bob = running_node(18312).await;
    let bob_did = introduce(&alice, &bob).await;
    let alice_did = alice.did().unwrap();

    assert!(alice.send_message("ping", &bob_did).await);
    let (sender, text) = recv(&bob).await;
    assert_eq!(sender, alice_did);
    assert_eq!(text, "ping");

    // Bob learned Alice's document during the handshake; no introduction
    // needed for the reply.
    assert!(bob.send_message("pong", &sender).await);
    let (sender, text) = recv(&alice).await;
    assert_eq!(sender, bob_did);
    assert_eq!(text, "pong");

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let alice = running_node(18321).await;
    let bob = running_node(18322).await;
    let bob_did = introduce(&alice, &bob).await;

    for i in 0..10 {
        assert!(alice.send_message(&format!("message-{}", i), &bob_did).await);
    }
    for i in 0..10 {
        let (_, text) = recv(&bob).await;
        assert_eq!(text, format!("message-{}", i));
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_concurrent_sends_share_one_connection() {
    let alice = running_node(18331).await;
    let bob = running_node(18332).await;
    let bob_did = introduce(&alice, &bob).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let alice = alice.clone();
        let bob_did = bob_did.clone();
        tasks.push(tokio::spawn(async move {
            alice.send_message(&format!("burst-{}", i), &bob_did).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }
    for _ in 0..8 {
        recv(&bob).await;
    }

    // Single-flight establishment: eight concurrent senders, one handshake.
    assert_eq!(alice.metrics().connections_opened, 1);
    assert_eq!(alice.metrics().messages_sent, 8);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_send_to_unknown_did_returns_false() {
    let alice = running_node(18341).await;

    let unknown = "did:node:0000000000000000000000000000000000000000";
    assert!(!alice.send_message("hello?", unknown).await);
    assert_eq!(alice.metrics().send_failures, 1);
    assert_eq!(alice.metrics().messages_sent, 0);

    alice.stop().await;
}

#[tokio::test]
async fn test_second_run_rejected() {
    let alice = running_node(18351).await;
    assert!(matches!(alice.run().await, Err(NodeError::AlreadyRunning)));
    alice.stop().await;
}

#[tokio::test]
async fn test_stop_wakes_pending_receive() {
    let alice = running_node(18361).await;

    let pending = tokio::spawn({
        let alice = alice.clone();
        async move { alice.receive_message().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("receive must not hang after stop")
        .unwrap();
    assert!(matches!(result, Err(NodeError::NodeStopped)));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_send_fails_after() {
    let alice = running_node(18371).await;
    let bob = running_node(18372).await;
    let bob_did = introduce(&alice, &bob).await;

    assert!(alice.send_message("before", &bob_did).await);
    recv(&bob).await;

    alice.stop().await;
    alice.stop().await;

    assert!(!alice.send_message("after", &bob_did).await);

    bob.stop().await;
}

#[tokio::test]
async fn test_stop_interrupts_in_flight_send() {
    // A TCP listener that accepts and then stays silent, so connection
    // establishment hangs until its (deliberately long) deadline.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut config = NodeConfig::new("127.0.0.1", 18391, "/ws");
    config.connect_timeout = Duration::from_secs(30);
    config.handshake_timeout = Duration::from_secs(30);
    let alice = SimpleNode::new(config);
    let (private_key, did, document) = alice.generate_did_document().unwrap();
    alice.set_did_info(&private_key, &did, &document).unwrap();
    alice.run().await.unwrap();
    let alice = Arc::new(alice);

    // A valid peer document whose endpoint is the silent listener.
    let decoy = SimpleNode::new(NodeConfig::new("127.0.0.1", silent_port, "/ws"));
    let (_, decoy_did, decoy_document) = decoy.generate_did_document().unwrap();
    alice.add_peer_document(&decoy_document).await.unwrap();

    let pending = tokio::spawn({
        let alice = alice.clone();
        async move { alice.send_message("hello", &decoy_did).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.stop().await;

    // The send must fail promptly, not ride out its 30s dial deadline.
    let sent = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("send must not outlive stop")
        .unwrap();
    assert!(!sent);
}

#[tokio::test]
async fn test_redial_after_peer_restart() {
    let alice = running_node(18381).await;

    // First peer on the port.
    let bob = running_node(18382).await;
    let bob_did = introduce(&alice, &bob).await;
    assert!(alice.send_message("first", &bob_did).await);
    recv(&bob).await;
    bob.stop().await;
    // Give the listener socket time to release.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A new node (new identity) takes over the endpoint. Sends to the old
    // DID now fail: the cached connection is gone and the replacement peer
    // cannot prove the old identity.
    let carol = running_node(18382).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!alice.send_message("second", &bob_did).await);

    // Introducing Carol's own document makes the endpoint reachable again.
    let carol_did = introduce(&alice, &carol).await;
    assert!(alice.send_message("third", &carol_did).await);
    let (_, text) = recv(&carol).await;
    assert_eq!(text, "third");

    alice.stop().await;
    carol.stop().await;
}
