//! Connection state machine and adaptive failure detection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Transport connection lifecycle state. A connection is never in two states
/// at once; `Reconnecting` additionally carries an overlay flag on
/// [`ConnState`] while the retry loop cycles through
/// Disconnected → Connecting attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The transport-level connection is acknowledged.
    Connected,
    /// The reconnect loop owns the connection.
    Reconnecting,
    /// An orderly teardown is in progress.
    Disconnecting,
}

/// One outstanding liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Clock value carried by the probe; the reply echoes it.
    pub timestamp_ms: u64,
    /// When the probe left.
    pub sent_at: Instant,
}

/// The transport's mutable connection record.
///
/// Mutated exclusively through scheduled tasks over the `connection`
/// resource.
#[derive(Debug)]
pub struct ConnState {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Remote address, set on the first connect attempt.
    pub server_addr: Option<SocketAddr>,
    /// Monotonically increasing ping sequence.
    pub ping_sequence: u32,
    /// Last inbound activity of any kind.
    pub last_activity: Option<Instant>,
    /// When the last heartbeat probe was sent.
    pub last_heartbeat: Option<Instant>,
    /// The probe currently awaiting a reply, if any.
    pub outstanding_probe: Option<Probe>,
    /// Adaptive timeout multiplier, `1..=cap`.
    pub timeout_multiplier: u32,
    /// Consecutive unanswered probes.
    pub consecutive_failures: u32,
    /// Flagged after the failure threshold; cleared on the next reply.
    pub degraded: bool,
    /// Overlay flag: the reconnect loop is cycling attempts.
    pub reconnecting: bool,
    /// While set, health-check timeouts are relaxed for a zone transition.
    pub relief_until: Option<Instant>,
    /// Session id assigned by the server after authentication.
    pub session_id: Option<u32>,
}

impl ConnState {
    /// Fresh, disconnected state.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            server_addr: None,
            ping_sequence: 0,
            last_activity: None,
            last_heartbeat: None,
            outstanding_probe: None,
            timeout_multiplier: 1,
            consecutive_failures: 0,
            degraded: false,
            reconnecting: false,
            relief_until: None,
            session_id: None,
        }
    }

    /// Reset everything connection-scoped back to the disconnected baseline.
    /// The adaptive multiplier resets too: a fresh connection starts from
    /// the base timeout.
    pub fn reset(&mut self) {
        let server_addr = self.server_addr;
        let reconnecting = self.reconnecting;
        *self = Self::new();
        self.server_addr = server_addr;
        self.reconnecting = reconnecting;
    }

    /// Next value of the ping sequence.
    pub fn next_ping_sequence(&mut self) -> u32 {
        self.ping_sequence = self.ping_sequence.wrapping_add(1);
        self.ping_sequence
    }

    /// The effective probe timeout: base × adaptive multiplier, further
    /// relaxed by `relief_factor` while a zone-transition window is active.
    pub fn effective_timeout(
        &self,
        base: Duration,
        relief_factor: u32,
        now: Instant,
    ) -> Duration {
        let mut timeout = base * self.timeout_multiplier;
        if self.relief_until.is_some_and(|until| now < until) {
            timeout *= relief_factor;
        }
        timeout
    }

    /// Record an unanswered probe: bump the failure counter and grow the
    /// adaptive multiplier (capped).
    pub fn record_probe_failure(&mut self, multiplier_cap: u32) {
        self.consecutive_failures += 1;
        self.timeout_multiplier = (self.timeout_multiplier + 1).min(multiplier_cap.max(1));
        self.outstanding_probe = None;
    }

    /// Record a reply: clear the failure streak, and if the round trip came
    /// in under a third of the current timeout, decay the multiplier one
    /// step.
    pub fn record_probe_success(&mut self, rtt: Duration, base: Duration) {
        self.consecutive_failures = 0;
        self.degraded = false;
        self.outstanding_probe = None;
        let current = base * self.timeout_multiplier;
        if rtt < current / 3 {
            self.timeout_multiplier = self.timeout_multiplier.saturating_sub(1).max(1);
        }
    }
}

impl Default for ConnState {
    fn default() -> Self {
        Self::new()
    }
}
