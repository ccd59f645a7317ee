// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end fan-out tests over real WebSocket connections.
//!
//! Each test starts a relay on `127.0.0.1:0`, connects `tokio-tungstenite`
//! clients, and waits until the hub has registered every client before
//! sending, since registration completes after the client handshake.

use std::sync::Arc;
use std::time::Duration;

use campus_relay::hub::RelayHub;
use campus_relay::server::{self, ConnectionLimits};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

type Client =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> (String, Arc<RelayHub>) {
    let hub = Arc::new(RelayHub::new());
    let (addr, _handle) =
        server::start_server_with_hub("127.0.0.1:0", Arc::clone(&hub), ConnectionLimits::default())
            .await
            .expect("failed to start relay server");
    (format!("ws://{addr}/ws"), hub)
}

async fn wait_for_peers(hub: &RelayHub, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while hub.peer_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("hub never reached {count} peers (has {})", hub.peer_count()));
}

async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Connects `n` clients and waits until all of them are registered.
async fn connect_many(url: &str, hub: &RelayHub, n: usize) -> Vec<Client> {
    let before = hub.peer_count();
    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        clients.push(connect(url).await);
    }
    wait_for_peers(hub, before + n).await;
    clients
}

async fn send_text(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Receives the next text frame, skipping control frames.
async fn recv_text(ws: &mut Client) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Asserts that no data frame arrives within a short window.
async fn assert_silent(ws: &mut Client) {
    let got = tokio::time::timeout(Duration::from_millis(200), recv_text(ws)).await;
    assert!(got.is_err(), "expected no message, got {got:?}");
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn three_peers_sender_excluded() {
    let (url, hub) = start_relay().await;
    let mut peers = connect_many(&url, &hub, 3).await;

    send_text(&mut peers[0], "loc:1,2").await;

    assert_eq!(recv_text(&mut peers[1]).await, "loc:1,2");
    assert_eq!(recv_text(&mut peers[2]).await, "loc:1,2");
    assert_silent(&mut peers[0]).await;
    assert_silent(&mut peers[1]).await;
    assert_silent(&mut peers[2]).await;
}

#[tokio::test]
async fn departed_peer_gets_nothing() {
    let (url, hub) = start_relay().await;
    let mut peers = connect_many(&url, &hub, 2).await;

    let mut b = peers.pop().unwrap();
    b.close(None).await.unwrap();
    wait_for_peers(&hub, 1).await;

    let mut a = peers.pop().unwrap();
    send_text(&mut a, "ping").await;
    assert_silent(&mut a).await;

    // The sender's connection is still healthy afterwards.
    let mut c = connect(&url).await;
    wait_for_peers(&hub, 2).await;
    send_text(&mut a, "still here").await;
    assert_eq!(recv_text(&mut c).await, "still here");
}

#[tokio::test]
async fn single_sender_order_is_preserved() {
    let (url, hub) = start_relay().await;
    let mut peers = connect_many(&url, &hub, 3).await;

    // Peer 2 sends concurrently with peer 0 so B sees interleaved traffic.
    let mut noisy = peers.pop().unwrap();
    let noise = tokio::spawn(async move {
        for i in 0..20 {
            send_text(&mut noisy, &format!("noise-{i}")).await;
        }
        noisy
    });

    for m in ["m1", "m2", "m3"] {
        send_text(&mut peers[0], m).await;
    }

    let mut seen = Vec::new();
    while seen.len() < 23 {
        seen.push(recv_text(&mut peers[1]).await);
    }
    let ordered: Vec<&str> = seen
        .iter()
        .map(String::as_str)
        .filter(|m| m.starts_with('m'))
        .collect();
    assert_eq!(ordered, vec!["m1", "m2", "m3"]);

    let noise_order: Vec<&String> = seen.iter().filter(|m| m.starts_with("noise")).collect();
    for (i, m) in noise_order.iter().enumerate() {
        assert_eq!(**m, format!("noise-{i}"));
    }
    let _noisy = noise.await.unwrap();
}

#[tokio::test]
async fn hundred_peers_each_receive_once() {
    let (url, hub) = start_relay().await;
    let mut peers = connect_many(&url, &hub, 100).await;

    send_text(&mut peers[0], "bus-7:31.2304,121.4737").await;

    let mut tasks = Vec::new();
    for mut ws in peers.drain(1..) {
        tasks.push(tokio::spawn(async move {
            let got = recv_text(&mut ws).await;
            assert_silent(&mut ws).await;
            got
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "bus-7:31.2304,121.4737");
    }
    assert_silent(&mut peers[0]).await;
}

#[tokio::test]
async fn late_joiner_only_sees_later_messages() {
    let (url, hub) = start_relay().await;
    let mut peers = connect_many(&url, &hub, 2).await;

    send_text(&mut peers[0], "before").await;
    assert_eq!(recv_text(&mut peers[1]).await, "before");

    let mut late = connect(&url).await;
    wait_for_peers(&hub, 3).await;
    send_text(&mut peers[0], "after").await;

    assert_eq!(recv_text(&mut late).await, "after");
    assert_eq!(recv_text(&mut peers[1]).await, "after");
}
