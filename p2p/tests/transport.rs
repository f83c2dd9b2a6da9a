//! Live-socket transport tests: handshake, message delivery, graceful and
//! abrupt disconnects over real loopback TCP.

use meshbook_p2p::{
    encode_frame, CircuitBreaker, CircuitBreakerConfig, ConnectionConfig, ConnectionEvent,
    DirectConnectionService, FrameDecoder, Message, P2pError, PROTOCOL_VERSION,
};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

fn config() -> ConnectionConfig {
    ConnectionConfig {
        host: "127.0.0.1".into(),
        port: 0,
        handshake_timeout: Duration::from_secs(2),
        message_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::default()))
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
) -> ConnectionEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_handshake_and_message_delivery() {
    let (alpha, mut alpha_rx) = DirectConnectionService::new("node-a", config(), breaker());
    let (addr, _listener) = alpha.listen().await.unwrap();

    let (beta, mut beta_rx) = DirectConnectionService::new("node-b", config(), breaker());
    let peer = beta.dial("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(peer, "node-a");

    // Both sides observe the new peer with the right direction flag.
    let ConnectionEvent::PeerConnected(info) = next_event(&mut beta_rx).await else {
        panic!("expected outbound PeerConnected");
    };
    assert_eq!(info.node_id, "node-a");
    assert!(!info.inbound);

    let ConnectionEvent::PeerConnected(info) = next_event(&mut alpha_rx).await else {
        panic!("expected inbound PeerConnected");
    };
    assert_eq!(info.node_id, "node-b");
    assert!(info.inbound);
    assert!(alpha.is_connected("node-b"));
    assert!(beta.is_connected("node-a"));

    // Application frames are delivered to the node layer.
    beta.send(
        "node-a",
        Message::PeerExchangeRequest {
            node_id: SmolStr::new("node-b"),
            timestamp: Message::now_ms(),
        },
    )
    .unwrap();

    let ConnectionEvent::Message { peer, message, .. } = next_event(&mut alpha_rx).await else {
        panic!("expected message event");
    };
    assert_eq!(peer, "node-b");
    assert_eq!(message.kind(), "peer_exchange_request");
}

#[tokio::test]
async fn test_heartbeat_is_answered_internally() {
    let (alpha, mut alpha_rx) = DirectConnectionService::new("node-a", config(), breaker());
    let (addr, _listener) = alpha.listen().await.unwrap();
    let (beta, mut beta_rx) = DirectConnectionService::new("node-b", config(), breaker());
    beta.dial("127.0.0.1", addr.port()).await.unwrap();
    next_event(&mut alpha_rx).await;
    next_event(&mut beta_rx).await;

    beta.send(
        "node-a",
        Message::Heartbeat {
            node_id: SmolStr::new("node-b"),
            timestamp: Message::now_ms(),
        },
    )
    .unwrap();

    // The probe never reaches alpha's node layer; the ack reaches beta's.
    let ConnectionEvent::Message { message, .. } = next_event(&mut beta_rx).await else {
        panic!("expected heartbeat ack event");
    };
    assert_eq!(message.kind(), "heartbeat_ack");
    assert!(alpha_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_graceful_disconnect_notifies_both_sides() {
    let (alpha, mut alpha_rx) = DirectConnectionService::new("node-a", config(), breaker());
    let (addr, _listener) = alpha.listen().await.unwrap();
    let (beta, mut beta_rx) = DirectConnectionService::new("node-b", config(), breaker());
    beta.dial("127.0.0.1", addr.port()).await.unwrap();
    next_event(&mut alpha_rx).await;
    next_event(&mut beta_rx).await;

    beta.disconnect("node-a", "test over");

    let ConnectionEvent::PeerDisconnected { peer, .. } = next_event(&mut beta_rx).await else {
        panic!("expected local PeerDisconnected");
    };
    assert_eq!(peer, "node-a");

    let ConnectionEvent::PeerDisconnected { peer, reason } = next_event(&mut alpha_rx).await
    else {
        panic!("expected remote PeerDisconnected");
    };
    assert_eq!(peer, "node-b");
    assert_eq!(reason, "test over");
    assert!(!beta.is_connected("node-a"));
}

#[tokio::test]
async fn test_send_to_unknown_peer_fails() {
    let (alpha, _rx) = DirectConnectionService::new("node-a", config(), breaker());
    let err = alpha
        .send(
            "nobody",
            Message::Heartbeat {
                node_id: SmolStr::new("node-a"),
                timestamp: Message::now_ms(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, P2pError::NotConnected(_)));
}

#[tokio::test]
async fn test_broadcast_with_zero_peers_is_empty() {
    let (alpha, _rx) = DirectConnectionService::new("node-a", config(), breaker());
    let outcomes = alpha.broadcast(&Message::Heartbeat {
        node_id: SmolStr::new("node-a"),
        timestamp: Message::now_ms(),
    });
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn test_version_mismatch_is_answered_and_closed() {
    let (alpha, mut alpha_rx) = DirectConnectionService::new("node-a", config(), breaker());
    let (addr, _listener) = alpha.listen().await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let bad_handshake = Message::Handshake {
        node_id: SmolStr::new("node-x"),
        timestamp: Message::now_ms(),
        version: "0.9.9".into(),
        port: 4100,
        capabilities: vec![],
    };
    raw.write_all(&encode_frame(&bad_handshake).unwrap())
        .await
        .unwrap();

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    let reply = loop {
        let n = timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed before error frame");
        decoder.extend(&buf[..n]);
        if let Some(message) = decoder.next_frame().unwrap() {
            break message;
        }
    };
    let Message::Error { code, .. } = reply else {
        panic!("expected protocol error frame");
    };
    assert_eq!(code, "PROTOCOL_VERSION_MISMATCH");

    // The peer was never promoted.
    assert!(alpha.connected_peers().is_empty());
    assert!(alpha_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_self_connection_dropped_silently() {
    let (alpha, mut alpha_rx) = DirectConnectionService::new("node-a", config(), breaker());
    let (addr, _listener) = alpha.listen().await.unwrap();

    // The receiving side drops silently, so the dialer observes either the
    // closed socket or, in-process, the self-connection directly.
    let err = alpha.dial("127.0.0.1", addr.port()).await.unwrap_err();
    assert!(matches!(
        err,
        P2pError::SelfConnection | P2pError::Io(_) | P2pError::HandshakeTimeout
    ));
    assert!(alpha.connected_peers().is_empty());

    // Neither side surfaced a peer event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alpha_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_protocol_version_constant_matches_wire() {
    assert_eq!(PROTOCOL_VERSION, "1.0.0");
}
