//! The raw channel abstraction and an in-process loopback implementation.
//!
//! The raw channel is the external unreliable/reliable datagram substrate
//! the transport is built on. It is not safely usable from two threads at
//! once; [`crate::NetTransport`] serializes all access behind a mutex.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by a raw channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The connect attempt did not complete within its wall-clock bound.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The operation requires an established connection.
    #[error("channel is not connected")]
    NotConnected,
    /// The underlying transport reported a failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// One event drained from a raw channel poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The transport-level connection was acknowledged.
    Connected,
    /// The peer is gone: orderly close or detected loss.
    Disconnected,
    /// One inbound payload (datagram or completed stream).
    Data(Vec<u8>),
}

/// The unreliable/reliable datagram substrate the transport runs on.
///
/// Blocking calls (`connect`, `disconnect`) loop on a bounded-timeout poll of
/// the underlying transport and must only be made from worker threads.
/// `poll` is non-blocking: it drains at most `max_events` pending events and
/// returns.
pub trait RawChannel: Send {
    /// Establish a connection within `timeout`.
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), ChannelError>;

    /// Tear the connection down, waiting at most `timeout` for the peer to
    /// acknowledge before forcing it.
    fn disconnect(&mut self, timeout: Duration);

    /// Send one payload, reliably or as a fire-and-forget datagram.
    fn send(&mut self, data: &[u8], reliable: bool) -> Result<(), ChannelError>;

    /// Drain up to `max_events` pending events without blocking.
    fn poll(&mut self, max_events: usize) -> Vec<ChannelEvent>;

    /// Whether a connection is currently established.
    fn is_open(&self) -> bool;
}

/// One frame as seen by the scripted peer side of a [`MemoryChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerFrame {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Reliability flag the sender requested.
    pub reliable: bool,
}

/// In-process loopback channel for deterministic transport tests.
///
/// The paired [`MemoryPeer`] plays the server: it observes everything the
/// transport sends and injects whatever events the test scenario calls for.
pub struct MemoryChannel {
    to_peer: Sender<PeerFrame>,
    from_peer: Receiver<ChannelEvent>,
    link_up: Arc<AtomicBool>,
    open: bool,
}

impl MemoryChannel {
    /// Create a channel/peer pair. The link starts up; the channel still
    /// needs an explicit `connect`.
    pub fn pair() -> (MemoryChannel, MemoryPeer) {
        let (to_peer, peer_rx) = unbounded();
        let (peer_tx, from_peer) = unbounded();
        let link_up = Arc::new(AtomicBool::new(true));
        (
            MemoryChannel {
                to_peer,
                from_peer,
                link_up: Arc::clone(&link_up),
                open: false,
            },
            MemoryPeer {
                rx: peer_rx,
                tx: peer_tx,
                link_up,
            },
        )
    }
}

impl RawChannel for MemoryChannel {
    fn connect(&mut self, _addr: SocketAddr, timeout: Duration) -> Result<(), ChannelError> {
        if self.link_up.load(Ordering::SeqCst) {
            self.open = true;
            Ok(())
        } else {
            Err(ChannelError::ConnectTimeout(timeout))
        }
    }

    fn disconnect(&mut self, _timeout: Duration) {
        self.open = false;
    }

    fn send(&mut self, data: &[u8], reliable: bool) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::NotConnected);
        }
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("link down".to_string()));
        }
        self.to_peer
            .send(PeerFrame {
                data: data.to_vec(),
                reliable,
            })
            .map_err(|_| ChannelError::Transport("peer dropped".to_string()))
    }

    fn poll(&mut self, max_events: usize) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if self.open && !self.link_up.load(Ordering::SeqCst) {
            self.open = false;
            events.push(ChannelEvent::Disconnected);
            return events;
        }
        while events.len() < max_events {
            match self.from_peer.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.open {
                        self.open = false;
                        events.push(ChannelEvent::Disconnected);
                    }
                    break;
                }
            }
        }
        events
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Test-side handle for a [`MemoryChannel`].
pub struct MemoryPeer {
    rx: Receiver<PeerFrame>,
    tx: Sender<ChannelEvent>,
    link_up: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next frame the transport sent, if any.
    pub fn try_recv(&self) -> Option<PeerFrame> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PeerFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// All frames currently pending.
    pub fn drain(&self) -> Vec<PeerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Deliver an event to the channel's next poll.
    pub fn inject(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    /// Deliver inbound payload bytes.
    pub fn inject_data(&self, data: Vec<u8>) {
        self.inject(ChannelEvent::Data(data));
    }

    /// Simulate losing the link: subsequent connects fail and the channel
    /// observes `Disconnected` on its next poll.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }
}
