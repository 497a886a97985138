#![warn(missing_docs)]
//! Adaptive network transport for the ironveil client.
//!
//! Owns the connection state machine, heartbeat/RTT estimation, the priority
//! outbound queue, and multi-category bandwidth shaping. Every mutation of
//! shared transport state is expressed as a task against named resources on
//! the [`ironveil_sched::Scheduler`], and every message on the wire goes
//! through the [`ironveil_wire`] codec.

mod bandwidth;
mod channel;
mod classify;
mod config;
mod diagnostics;
mod queue;
mod quic;
mod state;
mod transport;

pub use bandwidth::{BandwidthShaper, PriorityMode, TokenBucket};
pub use channel::{ChannelError, ChannelEvent, MemoryChannel, MemoryPeer, PeerFrame, RawChannel};
pub use classify::{Classified, MessageCategory, MessageRule, MessageTable};
pub use config::{
    BandwidthConfig, HeartbeatConfig, NetConfig, QueueConfig, RateBurst, ReconnectConfig,
};
pub use diagnostics::{DiagnosticsSnapshot, NetworkDiagnostics};
pub use queue::{OutboundQueue, QueuedPacket, SendPriority};
pub use quic::{QuicChannel, QuicListener, QuicServerConn};
pub use state::{ConnState, ConnectionState, Probe};
pub use transport::{reconnect_backoff, DisconnectReason, NetError, NetTransport, SendOutcome};
