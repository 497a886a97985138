//! Process-lifetime network diagnostics: RTT statistics, jitter, loss, and
//! downtime accounting. Reset only by explicit user action.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Ring-buffer window used for jitter; RTT min/max/avg run over the whole
/// process lifetime.
const PING_WINDOW: usize = 32;

/// Aggregated network health counters.
#[derive(Debug)]
pub struct NetworkDiagnostics {
    window: VecDeque<f64>,
    ping_min_ms: f64,
    ping_max_ms: f64,
    ping_sum_ms: f64,
    pings_sent: u64,
    pongs_received: u64,
    disconnects: u32,
    reconnects: u32,
    downtime_started: Option<Instant>,
    longest_downtime: Duration,
}

impl NetworkDiagnostics {
    /// Empty diagnostics.
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(PING_WINDOW),
            ping_min_ms: f64::INFINITY,
            ping_max_ms: 0.0,
            ping_sum_ms: 0.0,
            pings_sent: 0,
            pongs_received: 0,
            disconnects: 0,
            reconnects: 0,
            downtime_started: None,
            longest_downtime: Duration::ZERO,
        }
    }

    /// Count one probe leaving.
    pub fn record_ping_sent(&mut self) {
        self.pings_sent += 1;
    }

    /// Record one measured round trip.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let ms = rtt.as_secs_f64() * 1_000.0;
        self.pongs_received += 1;
        self.ping_min_ms = self.ping_min_ms.min(ms);
        self.ping_max_ms = self.ping_max_ms.max(ms);
        self.ping_sum_ms += ms;
        if self.window.len() == PING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(ms);
    }

    /// Count a disconnection and open a downtime interval.
    pub fn record_disconnect(&mut self, now: Instant) {
        self.disconnects += 1;
        if self.downtime_started.is_none() {
            self.downtime_started = Some(now);
        }
    }

    /// Close an open downtime interval after a successful connect. The
    /// reconnect counter only moves when a disconnect actually preceded the
    /// connect, so it always pairs with the disconnect counter; the very
    /// first connect of a session is not a "reconnect".
    pub fn record_reconnect(&mut self, now: Instant) {
        if let Some(started) = self.downtime_started.take() {
            self.reconnects += 1;
            let downtime = now.saturating_duration_since(started);
            if downtime > self.longest_downtime {
                self.longest_downtime = downtime;
            }
        }
    }

    /// Jitter: population standard deviation of the bounded RTT window.
    pub fn jitter_ms(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        let variance = self
            .window
            .iter()
            .map(|sample| {
                let diff = sample - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.window.len() as f64;
        variance.sqrt()
    }

    /// Estimated packet loss: unanswered probes over probes sent.
    pub fn loss_percent(&self) -> f64 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        let lost = self.pings_sent.saturating_sub(self.pongs_received) as f64;
        lost / self.pings_sent as f64 * 100.0
    }

    /// Copy the current values out.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            ping_min_ms: if self.pongs_received == 0 {
                0.0
            } else {
                self.ping_min_ms
            },
            ping_max_ms: self.ping_max_ms,
            ping_avg_ms: if self.pongs_received == 0 {
                0.0
            } else {
                self.ping_sum_ms / self.pongs_received as f64
            },
            jitter_ms: self.jitter_ms(),
            loss_percent: self.loss_percent(),
            pings_sent: self.pings_sent,
            pongs_received: self.pongs_received,
            disconnects: self.disconnects,
            reconnects: self.reconnects,
            longest_downtime: self.longest_downtime,
        }
    }

    /// Clear everything. Only ever called on explicit user action.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for NetworkDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`NetworkDiagnostics`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsSnapshot {
    /// Smallest round trip seen, milliseconds.
    pub ping_min_ms: f64,
    /// Largest round trip seen, milliseconds.
    pub ping_max_ms: f64,
    /// Mean round trip over the process lifetime, milliseconds.
    pub ping_avg_ms: f64,
    /// Population standard deviation of the recent RTT window.
    pub jitter_ms: f64,
    /// Unanswered probes over probes sent, percent.
    pub loss_percent: f64,
    /// Probes sent.
    pub pings_sent: u64,
    /// Replies received.
    pub pongs_received: u64,
    /// Disconnection events.
    pub disconnects: u32,
    /// Successful (re)connections after a disconnect.
    pub reconnects: u32,
    /// Longest gap between a disconnect and the following reconnect.
    pub longest_downtime: Duration,
}

impl Default for DiagnosticsSnapshot {
    fn default() -> Self {
        NetworkDiagnostics::new().snapshot()
    }
}
