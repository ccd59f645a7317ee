//! Relay hub: the live peer set and sender-excluding fan-out.
//!
//! The hub owns every connected peer and forwards each inbound
//! [`Payload`] verbatim to all other open peers. It knows nothing about
//! sockets: the server gives each connection a [`PeerLink`] and drives the
//! hub through [`RelayHub::connect`], [`RelayHub::broadcast`] and
//! [`RelayHub::disconnect`].
//!
//! # Concurrency contract
//!
//! The peer set lives behind a single [`RwLock`]. `connect`, `disconnect`
//! and `close_all` take the write lock. `broadcast` holds an upgradable read
//! lock for the whole iterate-and-enqueue step and upgrades it in place to
//! evict overflowing receivers, so membership never changes underneath a
//! broadcast. Nothing awaits while a lock is held: enqueueing is a
//! non-blocking `try_send` into each receiver's bounded queue, and the
//! actual socket write happens on that receiver's own task.
//!
//! A peer is in the set if and only if its [`LinkState`] is
//! [`LinkState::Open`]. Every removal updates the state before the lock is
//! released.

use std::collections::HashMap;
use std::fmt;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Default capacity of each peer's outbound queue.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 64;

/// Unique identifier the hub assigns to a peer when it connects.
///
/// Backed by a UUID v7, so identifiers are never reused within a process
/// and sort by connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Link state of a peer as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Registered and eligible for broadcasts.
    Open,
    /// Removed by the hub (queue overflow or shutdown); the connection
    /// should send a close frame and stop.
    Closing,
    /// Removed after the connection itself went away.
    Closed,
}

/// An opaque relayed message. The frame kind is preserved end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A text frame.
    Text(Utf8Bytes),
    /// A binary frame.
    Binary(Bytes),
}

impl Payload {
    /// Builds a text payload.
    pub fn text(text: impl Into<Utf8Bytes>) -> Self {
        Self::Text(text.into())
    }

    /// Builds a binary payload.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Extracts the relayable payload from a WebSocket message.
    ///
    /// Control frames (ping, pong, close) carry no payload and yield `None`.
    #[must_use]
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
        }
    }

    /// Converts the payload back into a WebSocket message of the same kind.
    #[must_use]
    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data),
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns `true` if the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hub-side handle of one connected peer.
struct Peer {
    outbound: mpsc::Sender<Payload>,
    state: watch::Sender<LinkState>,
}

/// Connection-side half of a peer, returned by [`RelayHub::connect`].
///
/// The connection drains `outbound` to its transport and watches `state`
/// for hub-initiated closes.
#[derive(Debug)]
pub struct PeerLink {
    /// Identifier assigned by the hub.
    pub id: PeerId,
    /// Payloads queued for delivery to this peer, in send order.
    pub outbound: mpsc::Receiver<Payload>,
    /// Current link state as published by the hub.
    pub state: watch::Receiver<LinkState>,
}

/// Outcome of a single [`RelayHub::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of receivers the payload was queued for.
    pub delivered: usize,
    /// Receivers that could not take the payload and were removed.
    pub evicted: Vec<PeerId>,
}

/// Owns the peer set and performs fan-out broadcast.
///
/// Share it between connections with an `Arc`. See the module docs for the
/// locking contract.
pub struct RelayHub {
    peers: RwLock<HashMap<PeerId, Peer>>,
    outbound_queue_size: usize,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    /// Creates an empty hub with the default outbound queue size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_OUTBOUND_QUEUE_SIZE)
    }

    /// Creates an empty hub whose peers each get an outbound queue of
    /// `outbound_queue_size` payloads. A size of zero is raised to one.
    #[must_use]
    pub fn with_queue_size(outbound_queue_size: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            outbound_queue_size: outbound_queue_size.max(1),
        }
    }

    /// Capacity of each peer's outbound queue.
    #[must_use]
    pub const fn outbound_queue_size(&self) -> usize {
        self.outbound_queue_size
    }

    /// Registers a newly connected peer and returns its connection half.
    ///
    /// The peer receives every broadcast made after this call returns.
    pub fn connect(&self) -> PeerLink {
        let id = PeerId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue_size);
        let (state_tx, state_rx) = watch::channel(LinkState::Open);

        let mut peers = self.peers.write();
        let previous = peers.insert(
            id,
            Peer {
                outbound: outbound_tx,
                state: state_tx,
            },
        );
        debug_assert!(previous.is_none(), "peer id {id} assigned twice");
        let count = peers.len();
        drop(peers);

        tracing::info!(peer_id = %id, peers = count, "peer connected");

        PeerLink {
            id,
            outbound: outbound_rx,
            state: state_rx,
        }
    }

    /// Queues `payload` for every open peer except `from`.
    ///
    /// Never waits on a receiver. If a receiver's queue is full, that single
    /// delivery fails, the receiver is evicted (removed and moved to
    /// [`LinkState::Closing`]) and the remaining receivers are still served.
    /// A receiver whose connection already dropped its queue is removed and
    /// moved straight to [`LinkState::Closed`].
    ///
    /// A sender that is not in the set (for example one racing its own
    /// disconnect) produces an empty report.
    pub fn broadcast(&self, from: &PeerId, payload: &Payload) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut removals: Vec<(PeerId, LinkState)> = Vec::new();

        let peers = self.peers.upgradable_read();
        if !peers.contains_key(from) {
            tracing::debug!(peer_id = %from, "dropping message from unregistered sender");
            return report;
        }

        for (id, peer) in peers.iter().filter(|(id, _)| *id != from) {
            debug_assert_eq!(*peer.state.borrow(), LinkState::Open);
            match peer.outbound.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        from = %from,
                        peer_id = %id,
                        queue_size = self.outbound_queue_size,
                        "outbound queue full, evicting receiver"
                    );
                    removals.push((*id, LinkState::Closing));
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(from = %from, peer_id = %id, "receiver link already gone");
                    removals.push((*id, LinkState::Closed));
                }
            }
        }

        if !removals.is_empty() {
            let mut peers = RwLockUpgradableReadGuard::upgrade(peers);
            for (id, state) in removals {
                if let Some(peer) = peers.remove(&id) {
                    peer.state.send_replace(state);
                }
                report.evicted.push(id);
            }
        }

        tracing::trace!(
            from = %from,
            size = payload.len(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "broadcast"
        );
        report
    }

    /// Removes a peer after its connection went away.
    ///
    /// Returns `true` if the peer was in the set. Calling it again for the
    /// same identifier is a no-op that returns `false`.
    pub fn disconnect(&self, id: &PeerId) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.remove(id) else {
            return false;
        };
        peer.state.send_replace(LinkState::Closed);
        let count = peers.len();
        drop(peers);

        tracing::info!(peer_id = %id, peers = count, "peer disconnected");
        true
    }

    /// Removes every peer and moves each to [`LinkState::Closing`].
    ///
    /// Used on shutdown; returns how many peers were closed.
    pub fn close_all(&self) -> usize {
        let mut peers = self.peers.write();
        let count = peers.len();
        for (id, peer) in peers.drain() {
            tracing::debug!(peer_id = %id, "closing peer");
            peer.state.send_replace(LinkState::Closing);
        }
        drop(peers);

        if count > 0 {
            tracing::info!(peers = count, "closed all peers");
        }
        count
    }

    /// Returns `true` if the peer is currently open.
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Number of currently open peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}
