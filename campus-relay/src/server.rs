//! WebSocket transport for the relay hub.
//!
//! Each accepted WebSocket becomes one hub peer served by two tasks: a
//! reader that feeds inbound text and binary frames to
//! [`RelayHub::broadcast`], and a writer that drains the peer's outbound
//! queue onto the socket. When either task ends the other is aborted and
//! the peer is disconnected from the hub.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::hub::{LinkState, Payload, PeerId, PeerLink, RelayHub};

/// Errors that can occur while starting the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The TCP listener could not bind to the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was attempted.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The bound listener could not report its local address.
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Per-connection limits applied by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Upper bound on a single socket write. A receiver whose socket does
    /// not accept a frame within this time is disconnected.
    pub send_timeout: Duration,
    /// Interval between heartbeat pings; `None` disables them.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum accepted message size in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Some(Duration::from_secs(30)),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Clone)]
struct ServerState {
    hub: Arc<RelayHub>,
    limits: ConnectionLimits,
}

/// Handles an upgraded WebSocket connection for a single peer.
///
/// The connection lifecycle:
/// 1. Register with the hub.
/// 2. Spawn the writer (outbound queue, heartbeat, hub-initiated close).
/// 3. Spawn the reader (inbound frames to broadcast).
/// 4. When either finishes, abort the other and disconnect from the hub.
pub async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>, limits: ConnectionLimits) {
    let PeerLink {
        id: peer_id,
        outbound,
        state,
    } = hub.connect();
    let (ws_sender, mut ws_receiver) = socket.split();

    let mut write_task = tokio::spawn(write_loop(peer_id, ws_sender, outbound, state, limits));

    let reader_hub = Arc::clone(&hub);
    let mut read_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Close(_)) => {
                    tracing::debug!(peer_id = %peer_id, "received close frame");
                    break;
                }
                Ok(msg) => {
                    if let Some(payload) = Payload::from_message(msg) {
                        reader_hub.broadcast(&peer_id, &payload);
                    }
                }
                Err(e) => {
                    tracing::debug!(peer_id = %peer_id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    hub.disconnect(&peer_id);
}

/// Drains a peer's outbound queue onto its socket until the link ends.
///
/// Ends when the hub moves the peer out of [`LinkState::Open`] (after
/// sending a close frame), when the queue closes, or when a write fails or
/// exceeds `send_timeout`.
async fn write_loop(
    peer_id: PeerId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Payload>,
    mut state: watch::Receiver<LinkState>,
    limits: ConnectionLimits,
) {
    // The interval is only polled when heartbeats are enabled.
    let heartbeat_enabled = limits.heartbeat_interval.is_some();
    let period = limits
        .heartbeat_interval
        .unwrap_or(Duration::from_secs(3600))
        .max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            biased;
            _ = state.changed() => {
                let link = *state.borrow();
                tracing::debug!(peer_id = %peer_id, state = ?link, "hub closed link");
                let _ = tokio::time::timeout(limits.send_timeout, sink.send(Message::Close(None))).await;
                break;
            }
            next = outbound.recv() => match next {
                Some(payload) => payload.into_message(),
                None => break,
            },
            _ = heartbeat.tick(), if heartbeat_enabled => Message::Ping(Bytes::from_static(b"ping")),
        };

        match tokio::time::timeout(limits.send_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "websocket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(
                    peer_id = %peer_id,
                    timeout_ms = limits.send_timeout.as_millis(),
                    "receiver stalled, disconnecting"
                );
                break;
            }
        }
    }
}

/// Starts the relay server on the given address with a fresh hub and
/// default limits, returning the bound address and a join handle.
///
/// # Errors
///
/// Returns [`ServerError`] if the TCP listener cannot bind to the address.
pub async fn start_server(addr: &str) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
    start_server_with_hub(addr, Arc::new(RelayHub::new()), ConnectionLimits::default()).await
}

/// Starts the relay server around an existing hub. Runs until the task is
/// aborted.
///
/// # Errors
///
/// Returns [`ServerError`] if the TCP listener cannot bind to the address.
pub async fn start_server_with_hub(
    addr: &str,
    hub: Arc<RelayHub>,
    limits: ConnectionLimits,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
    start_server_with_shutdown(addr, hub, limits, std::future::pending()).await
}

/// Starts the relay server and stops it gracefully once `shutdown`
/// resolves: the listener stops accepting and every connected peer is sent
/// a close frame.
///
/// # Errors
///
/// Returns [`ServerError`] if the TCP listener cannot bind to the address.
pub async fn start_server_with_shutdown<F>(
    addr: &str,
    hub: Arc<RelayHub>,
    limits: ConnectionLimits,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let bound_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

    let shutdown_hub = Arc::clone(&hub);
    let app = axum::Router::new()
        .route("/", axum::routing::get(ws_handler))
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(ServerState { hub, limits });

    let handle = tokio::spawn(async move {
        let signal = async move {
            shutdown.await;
            tracing::info!("shutting down relay server");
            shutdown_hub.close_all();
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.max_message_size(state.limits.max_message_size)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, state.hub, state.limits))
}
