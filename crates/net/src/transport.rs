//! The adaptive network transport.
//!
//! Ties the connection state machine, heartbeat/RTT estimation, outbound
//! queueing, and bandwidth shaping together. The raw channel sits behind a
//! single mutex (it is not safe for concurrent use); every other piece of
//! shared state is owned by the scheduler's resource-lock discipline — reads
//! go through shared-lock tasks, writes through exclusive-lock tasks, and
//! each call declares the whole of its cross-cutting-state dependency.

use crate::bandwidth::{BandwidthShaper, PriorityMode};
use crate::channel::{ChannelError, ChannelEvent, RawChannel};
use crate::classify::{MessageRule, MessageTable};
use crate::config::NetConfig;
use crate::diagnostics::{DiagnosticsSnapshot, NetworkDiagnostics};
use crate::queue::{OutboundQueue, QueuedPacket, SendPriority};
use crate::state::{ConnState, ConnectionState, Probe};
use ironveil_sched::{ResourceId, ResourceTag, Scheduler, TaskClass, TaskError, TaskHandle};
use ironveil_wire::{is_legacy_frame, parse_legacy, Packet, WireMessage};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Factor applied to the health-check timeout during a zone transition.
const RELIEF_TIMEOUT_FACTOR: u32 = 3;

/// How long a zone-transition relaxation lasts before auto-restoring.
const RELIEF_WINDOW: Duration = Duration::from_secs(15);

/// Cap on the reconnect backoff delay.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Backoff delay after reconnect attempt `attempt` (1-based) fails:
/// `min(30s, 2^(attempt-1) seconds)`.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    Duration::from_secs(1u64 << exponent).min(BACKOFF_CAP)
}

/// Transport failures surfaced to callers.
///
/// Expected network conditions (peer loss, timeouts, throttling) are *not*
/// errors; they surface as state transitions, [`SendOutcome`] values, and
/// diagnostics counters.
#[derive(Debug, Error)]
pub enum NetError {
    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The raw channel reported a failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Another lifecycle operation is already in flight.
    #[error("a connection attempt is already in progress")]
    Busy,
    /// The reconnect loop exhausted its attempt budget.
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// A scheduled task failed to complete.
    #[error("scheduler error: {0}")]
    Task(#[from] TaskError),
}

/// Why the transport dropped to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application asked for it.
    Requested,
    /// The peer closed or the link was lost.
    PeerClosed,
    /// The health check forced it after repeated missed heartbeats.
    HealthCheck,
    /// The reconnect loop gave up.
    ReconnectFailed,
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted on the raw channel.
    Sent,
    /// Held in the outbound queue for replay after reconnect.
    Queued,
    /// Denied by the bandwidth shaper; not queued.
    Throttled,
    /// Dropped: the queue is at capacity.
    DroppedQueueFull,
    /// Dropped: disconnected and queueing is disabled.
    DroppedQueueDisabled,
    /// The raw channel refused the send.
    Failed,
}

type DisconnectHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(WireMessage) + Send + Sync>;
type RawHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    disconnect: Option<DisconnectHandler>,
    message: Option<MessageHandler>,
    raw: Option<RawHandler>,
}

/// State cells guarded by the scheduler's named resources. The inner locks
/// satisfy the borrow checker; task-level atomicity and ordering come from
/// the named locks the scheduler holds around each task.
struct Shared {
    conn: RwLock<ConnState>,
    diag: RwLock<NetworkDiagnostics>,
    queue: RwLock<OutboundQueue>,
    shaper: RwLock<BandwidthShaper>,
    table: RwLock<MessageTable>,
    handlers: RwLock<Handlers>,
    channel: Mutex<Box<dyn RawChannel>>,
    send_sequence: AtomicU32,
}

impl Shared {
    fn next_sequence(&self) -> u32 {
        self.send_sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// The named resources every transport task declares.
#[derive(Clone)]
struct Resources {
    connection: ResourceId,
    diagnostics: ResourceId,
    queue: ResourceId,
    bandwidth: ResourceId,
    table: ResourceId,
}

impl Resources {
    fn new() -> Self {
        Self {
            connection: ResourceId::new("connection", ResourceTag::State),
            diagnostics: ResourceId::new("diagnostics", ResourceTag::Stats),
            queue: ResourceId::new("outbound-queue", ResourceTag::Queue),
            bandwidth: ResourceId::new("bandwidth", ResourceTag::Config),
            table: ResourceId::new("message-table", ResourceTag::Config),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The client transport.
///
/// Cheap to clone; clones share all state. Blocking lifecycle operations
/// (`connect`, `disconnect`, `reconnect`) run on scheduler workers, so a
/// pool-backed scheduler needs at least two workers for the nested state
/// tasks they schedule.
#[derive(Clone)]
pub struct NetTransport {
    sched: Scheduler,
    shared: Arc<Shared>,
    res: Resources,
    server_addr: SocketAddr,
    cfg: NetConfig,
}

impl NetTransport {
    /// Build a transport over `channel`.
    ///
    /// Fails fast on invalid configuration; that is the only class of error
    /// allowed to be fatal here.
    pub fn new(
        cfg: NetConfig,
        channel: Box<dyn RawChannel>,
        sched: Scheduler,
    ) -> Result<Self, NetError> {
        let server_addr: SocketAddr = cfg.server_addr.parse().map_err(|err| {
            NetError::InvalidConfig(format!("server_addr {:?}: {err}", cfg.server_addr))
        })?;
        if cfg.heartbeat.max_consecutive_failures == 0 {
            return Err(NetError::InvalidConfig(
                "max_consecutive_failures must be positive".to_string(),
            ));
        }
        if cfg.heartbeat.interval_ms == 0 {
            return Err(NetError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }

        let now = Instant::now();
        let mut table = MessageTable::with_defaults();
        for rule in &cfg.rules {
            table.set_rule(rule.clone());
        }

        let shared = Arc::new(Shared {
            conn: RwLock::new(ConnState::new()),
            diag: RwLock::new(NetworkDiagnostics::new()),
            queue: RwLock::new(OutboundQueue::new(cfg.queue.max_size, cfg.queue_max_age())),
            shaper: RwLock::new(BandwidthShaper::new(&cfg.bandwidth, now)),
            table: RwLock::new(table),
            handlers: RwLock::new(Handlers::default()),
            channel: Mutex::new(channel),
            send_sequence: AtomicU32::new(0),
        });

        Ok(Self {
            sched,
            shared,
            res: Resources::new(),
            server_addr,
            cfg,
        })
    }

    /// The scheduler this transport runs its tasks on.
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Install the handler invoked (on a scheduler worker) when the
    /// connection drops for any reason other than an explicit `disconnect`.
    pub fn on_disconnect(&self, handler: impl Fn(DisconnectReason) + Send + Sync + 'static) {
        self.shared.handlers.write().disconnect = Some(Arc::new(handler));
    }

    /// Install the handler for application-level inbound messages.
    pub fn on_message(&self, handler: impl Fn(WireMessage) + Send + Sync + 'static) {
        self.shared.handlers.write().message = Some(Arc::new(handler));
    }

    /// Install the handler for inbound payloads that are not protocol
    /// packets (legacy/raw traffic).
    pub fn on_raw(&self, handler: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        self.shared.handlers.write().raw = Some(Arc::new(handler));
    }

    // ---- lifecycle ------------------------------------------------------

    /// Connect to the configured server on a worker thread.
    pub fn connect(&self) -> TaskHandle<Result<(), NetError>> {
        let this = self.clone();
        self.sched
            .spawn(TaskClass::Network, move || this.connect_on_worker())
    }

    /// Connect and wait for the outcome.
    pub fn connect_blocking(&self) -> Result<(), NetError> {
        self.connect().join()?
    }

    fn connect_on_worker(&self) -> Result<(), NetError> {
        let shared = Arc::clone(&self.shared);
        let addr = self.server_addr;
        let begun = self
            .sched
            .schedule(std::slice::from_ref(&self.res.connection), move || {
                let mut conn = shared.conn.write();
                match conn.state {
                    ConnectionState::Disconnected => {
                        conn.state = ConnectionState::Connecting;
                        conn.server_addr = Some(addr);
                        true
                    }
                    _ => false,
                }
            })
            .join()?;
        if !begun {
            return Err(NetError::Busy);
        }

        info!("connecting to {addr}");
        let attempt = {
            let mut channel = self.shared.channel.lock();
            channel.connect(addr, self.cfg.connect_timeout())
        };

        let shared = Arc::clone(&self.shared);
        let succeeded = attempt.is_ok();
        let resources = [self.res.connection.clone(), self.res.diagnostics.clone()];
        self.sched
            .schedule(&resources, move || {
                let now = Instant::now();
                let mut conn = shared.conn.write();
                if succeeded {
                    conn.state = ConnectionState::Connected;
                    conn.last_activity = Some(now);
                    conn.last_heartbeat = None;
                    conn.outstanding_probe = None;
                    conn.consecutive_failures = 0;
                    conn.degraded = false;
                    shared.diag.write().record_reconnect(now);
                } else {
                    conn.state = ConnectionState::Disconnected;
                }
            })
            .join()?;

        match attempt {
            Ok(()) => {
                info!("connected to {addr}");
                Ok(())
            }
            Err(err) => {
                warn!("connect to {addr} failed: {err}");
                Err(err.into())
            }
        }
    }

    /// Orderly disconnect on a worker thread: a Disconnect notice is sent,
    /// then the channel gets a bounded window to acknowledge before the
    /// teardown is forced.
    pub fn disconnect(&self) -> TaskHandle<Result<(), NetError>> {
        let this = self.clone();
        self.sched
            .spawn(TaskClass::Network, move || this.disconnect_on_worker())
    }

    /// Disconnect and wait for completion.
    pub fn disconnect_blocking(&self) -> Result<(), NetError> {
        self.disconnect().join()?
    }

    fn disconnect_on_worker(&self) -> Result<(), NetError> {
        let shared = Arc::clone(&self.shared);
        let was_connected = self
            .sched
            .schedule(std::slice::from_ref(&self.res.connection), move || {
                let mut conn = shared.conn.write();
                if conn.state == ConnectionState::Connected {
                    conn.state = ConnectionState::Disconnecting;
                    true
                } else {
                    false
                }
            })
            .join()?;
        if !was_connected {
            return Ok(());
        }

        {
            let mut channel = self.shared.channel.lock();
            let notice = WireMessage::Disconnect {
                reason: "client disconnect".to_string(),
            };
            if let Err(err) = channel.send(&notice.encode(self.shared.next_sequence()), true) {
                debug!("disconnect notice not delivered: {err}");
            }
            channel.disconnect(self.cfg.disconnect_timeout());
        }

        let shared = Arc::clone(&self.shared);
        let resources = [self.res.connection.clone(), self.res.diagnostics.clone()];
        self.sched
            .schedule(&resources, move || {
                let now = Instant::now();
                shared.conn.write().reset();
                shared.diag.write().record_disconnect(now);
            })
            .join()?;

        info!("disconnected");
        Ok(())
    }

    /// Reconnect with exponential backoff on a worker thread.
    ///
    /// Attempts are full synchronous connects; after attempt `n` fails the
    /// loop waits `min(30s, 2^(n-1))` seconds. Gives up permanently after
    /// the configured attempt limit.
    pub fn reconnect(&self) -> TaskHandle<Result<(), NetError>> {
        let this = self.clone();
        self.sched
            .spawn(TaskClass::Network, move || this.reconnect_on_worker())
    }

    fn reconnect_on_worker(&self) -> Result<(), NetError> {
        let max_attempts = self.cfg.reconnect.max_attempts.max(1);

        let shared = Arc::clone(&self.shared);
        let begun = self
            .sched
            .schedule(std::slice::from_ref(&self.res.connection), move || {
                let mut conn = shared.conn.write();
                if conn.state == ConnectionState::Disconnected && !conn.reconnecting {
                    conn.reconnecting = true;
                    true
                } else {
                    false
                }
            })
            .join()?;
        if !begun {
            return Err(NetError::Busy);
        }

        let mut outcome = Err(NetError::ReconnectExhausted {
            attempts: max_attempts,
        });
        for attempt in 1..=max_attempts {
            debug!("reconnect attempt {attempt}/{max_attempts}");
            match self.connect_on_worker() {
                Ok(()) => {
                    info!("reconnected on attempt {attempt}");
                    outcome = Ok(());
                    break;
                }
                Err(err) => {
                    warn!("reconnect attempt {attempt} failed: {err}");
                    if attempt < max_attempts {
                        std::thread::sleep(reconnect_backoff(attempt));
                    }
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule(std::slice::from_ref(&self.res.connection), move || {
                shared.conn.write().reconnecting = false;
            })
            .join()?;

        if outcome.is_err() {
            warn!("reconnect gave up after {max_attempts} attempts");
            self.fire_disconnect(DisconnectReason::ReconnectFailed);
        }
        outcome
    }

    // ---- hot receive path ----------------------------------------------

    /// Drain and dispatch up to the configured budget of inbound events.
    pub fn poll(&self) {
        self.poll_events(self.cfg.poll_budget);
    }

    /// Drain and dispatch up to `max_events` inbound events.
    ///
    /// This is the hot path: the raw channel is drained under its mutex
    /// without any resource scheduling; everything that touches shared
    /// state is then dispatched as scheduled tasks.
    pub fn poll_events(&self, max_events: usize) {
        let events = {
            let mut channel = self.shared.channel.lock();
            channel.poll(max_events)
        };
        for event in events {
            match event {
                ChannelEvent::Connected => trace!("transport-level connect acknowledged"),
                ChannelEvent::Disconnected => self.handle_peer_loss(DisconnectReason::PeerClosed),
                ChannelEvent::Data(bytes) => self.handle_inbound(bytes),
            }
        }
    }

    fn handle_peer_loss(&self, reason: DisconnectReason) {
        warn!("peer lost: {reason:?}");
        let shared = Arc::clone(&self.shared);
        let teardown_bound = self.cfg.disconnect_timeout();
        let resources = [self.res.connection.clone(), self.res.diagnostics.clone()];
        let handle = self.sched.schedule(&resources, move || {
            let now = Instant::now();
            let mut conn = shared.conn.write();
            if conn.state == ConnectionState::Disconnected {
                return;
            }
            conn.reset();
            shared.diag.write().record_disconnect(now);
            shared.channel.lock().disconnect(teardown_bound);
        });
        let _ = handle.join();
        self.fire_disconnect(reason);
    }

    fn handle_inbound(&self, bytes: Vec<u8>) {
        if let Some(packet) = Packet::decode(&bytes) {
            self.dispatch_message(packet.message);
            return;
        }
        if is_legacy_frame(&bytes) {
            if let Some(message) = std::str::from_utf8(&bytes).ok().and_then(parse_legacy) {
                self.dispatch_message(message);
                return;
            }
        }
        let handler = self.shared.handlers.read().raw.clone();
        match handler {
            Some(handler) => {
                self.sched
                    .spawn(TaskClass::Network, move || handler(bytes));
            }
            None => trace!("dropping {} non-protocol bytes", bytes.len()),
        }
    }

    fn dispatch_message(&self, message: WireMessage) {
        match &message {
            WireMessage::Heartbeat { timestamp_ms } => self.handle_heartbeat(*timestamp_ms),
            WireMessage::Disconnect { reason } => {
                info!("server closed the connection: {reason}");
                self.handle_peer_loss(DisconnectReason::PeerClosed);
            }
            WireMessage::Command { name, args } if name == "throttle" => {
                match args.first().and_then(|level| level.parse::<u8>().ok()) {
                    Some(level) => self.apply_throttle(level),
                    None => warn!("ignoring malformed throttle command"),
                }
            }
            WireMessage::AuthResponse {
                accepted,
                session_id,
                ..
            } => {
                let session = accepted.then_some(*session_id);
                let shared = Arc::clone(&self.shared);
                let handle = self
                    .sched
                    .schedule(std::slice::from_ref(&self.res.connection), move || {
                        let mut conn = shared.conn.write();
                        conn.last_activity = Some(Instant::now());
                        conn.session_id = session;
                    });
                let _ = handle.join();
                self.forward_to_app(message);
            }
            _ => {
                self.touch_activity();
                self.forward_to_app(message);
            }
        }
    }

    fn handle_heartbeat(&self, timestamp_ms: u64) {
        let shared = Arc::clone(&self.shared);
        let base = self.cfg.base_timeout();
        let resources = [self.res.connection.clone(), self.res.diagnostics.clone()];
        let handle = self.sched.schedule(&resources, move || {
            let now = Instant::now();
            let mut conn = shared.conn.write();
            conn.last_activity = Some(now);
            match conn.outstanding_probe {
                Some(probe) if probe.timestamp_ms == timestamp_ms => {
                    let rtt = now.saturating_duration_since(probe.sent_at);
                    conn.record_probe_success(rtt, base);
                    shared.diag.write().record_rtt(rtt);
                    trace!("pong: rtt {rtt:?}");
                }
                _ => {
                    // Unsolicited probe from the peer: echo it back so the
                    // other side can measure.
                    let reply = WireMessage::Heartbeat { timestamp_ms };
                    let bytes = reply.encode(shared.next_sequence());
                    let mut channel = shared.channel.lock();
                    if let Err(err) = channel.send(&bytes, false) {
                        debug!("heartbeat echo not sent: {err}");
                    }
                }
            }
        });
        let _ = handle.join();
    }

    fn touch_activity(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .sched
            .schedule(std::slice::from_ref(&self.res.connection), move || {
                shared.conn.write().last_activity = Some(Instant::now());
            });
        let _ = handle.join();
    }

    fn apply_throttle(&self, level: u8) {
        info!("server requested throttle level {level}");
        let shared = Arc::clone(&self.shared);
        let handle = self
            .sched
            .schedule(std::slice::from_ref(&self.res.bandwidth), move || {
                shared.shaper.write().set_throttle_level(level, Instant::now());
            });
        let _ = handle.join();
    }

    fn forward_to_app(&self, message: WireMessage) {
        let handler = self.shared.handlers.read().message.clone();
        match handler {
            Some(handler) => {
                self.sched
                    .spawn(TaskClass::Network, move || handler(message));
            }
            None => trace!("no message handler installed; {} dropped", message.label()),
        }
    }

    fn fire_disconnect(&self, reason: DisconnectReason) {
        let handler = self.shared.handlers.read().disconnect.clone();
        if let Some(handler) = handler {
            self.sched
                .spawn(TaskClass::Network, move || handler(reason));
        }
    }

    // ---- outbound path --------------------------------------------------

    /// Send a message, shaping it while connected and queueing it while
    /// disconnected (if queueing is enabled).
    pub fn send(&self, message: WireMessage, reliable: bool) -> SendOutcome {
        let label = message.kind().label();
        let bytes = message.encode(self.shared.next_sequence());
        self.send_framed(label, bytes, reliable)
    }

    /// Legacy text entry point. The frame is translated into its canonical
    /// framed form at this boundary; the queue never holds the text form.
    pub fn send_legacy(&self, text: &str, reliable: bool) -> SendOutcome {
        match parse_legacy(text) {
            Some(message) => self.send(message, reliable),
            None => {
                warn!("unrecognized legacy frame dropped");
                SendOutcome::Failed
            }
        }
    }

    /// Present credentials over the reliable path. Sent in the clear — a
    /// known weakness of the protocol, carried over as-is.
    pub fn authenticate(&self, username: &str, password: &str) -> SendOutcome {
        self.send(
            WireMessage::AuthRequest {
                username: username.to_string(),
                password: password.to_string(),
            },
            true,
        )
    }

    /// Request account creation over the reliable path.
    pub fn register(&self, username: &str, password: &str, email: &str) -> SendOutcome {
        self.send(
            WireMessage::Registration {
                username: username.to_string(),
                password: password.to_string(),
                email: email.to_string(),
            },
            true,
        )
    }

    fn send_framed(&self, label: &'static str, bytes: Vec<u8>, reliable: bool) -> SendOutcome {
        let shared = Arc::clone(&self.shared);
        let queue_enabled = self.cfg.queue.enabled;
        let resources = [
            self.res.connection.clone(),
            self.res.bandwidth.clone(),
            self.res.queue.clone(),
            self.res.table.clone(),
        ];
        let handle = self.sched.schedule(&resources, move || {
            let now = Instant::now();
            let classified = shared.table.read().classify(label);
            let connected = shared.conn.read().state == ConnectionState::Connected;

            if !connected {
                if !queue_enabled {
                    trace!("{label} dropped: disconnected and queueing disabled");
                    return SendOutcome::DroppedQueueDisabled;
                }
                let admitted = shared.queue.write().push(QueuedPacket {
                    payload: bytes,
                    reliable,
                    priority: classified.priority,
                    enqueued_at: now,
                });
                return if admitted {
                    SendOutcome::Queued
                } else {
                    debug!("{label} dropped: outbound queue full");
                    SendOutcome::DroppedQueueFull
                };
            }

            let size = bytes.len() as f64;
            if !shared.shaper.write().try_admit(
                classified.category,
                size,
                classified.throttle_exempt,
                now,
            ) {
                trace!("{label} throttled ({size} units)");
                return SendOutcome::Throttled;
            }

            let mut channel = shared.channel.lock();
            match channel.send(&bytes, reliable) {
                Ok(()) => SendOutcome::Sent,
                Err(err) => {
                    warn!("{label} send failed: {err}");
                    SendOutcome::Failed
                }
            }
        });
        handle.join().unwrap_or(SendOutcome::Failed)
    }

    // ---- periodic work --------------------------------------------------

    /// Run the periodic maintenance cycle: heartbeat emission, adaptive
    /// failure detection, health check, and queue replay.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Deterministic variant of [`Self::tick`] driven by an explicit clock,
    /// for tests and tooling.
    pub fn tick_at(&self, now: Instant) {
        let shared = Arc::clone(&self.shared);
        let interval = self.cfg.heartbeat_interval();
        let base = self.cfg.base_timeout();
        let multiplier_cap = self.cfg.heartbeat.timeout_multiplier_cap.max(1);
        let max_failures = self.cfg.heartbeat.max_consecutive_failures;
        let disconnect_timeout = self.cfg.disconnect_timeout();
        let replay_batch = self.cfg.queue.replay_batch.max(1);
        let replay_pause = self.cfg.replay_pause();

        let resources = [
            self.res.connection.clone(),
            self.res.diagnostics.clone(),
            self.res.queue.clone(),
        ];
        let handle = self.sched.schedule(&resources, move || {
            let mut conn = shared.conn.write();

            if conn.relief_until.is_some_and(|until| now >= until) {
                conn.relief_until = None;
                debug!("zone-transition relief expired; timeouts restored");
            }

            if conn.state != ConnectionState::Connected {
                return None;
            }

            // Probe timeout detection with the adaptive threshold.
            let effective = conn.effective_timeout(base, RELIEF_TIMEOUT_FACTOR, now);
            if let Some(probe) = conn.outstanding_probe {
                if now.saturating_duration_since(probe.sent_at) > effective {
                    conn.record_probe_failure(multiplier_cap);
                    let failures = conn.consecutive_failures;
                    if failures == max_failures {
                        conn.degraded = true;
                        warn!("connection degraded after {failures} missed heartbeats");
                    }
                    if failures >= 2 * max_failures {
                        warn!("health check: forcing disconnect after {failures} missed heartbeats");
                        shared.channel.lock().disconnect(disconnect_timeout);
                        conn.reset();
                        shared.diag.write().record_disconnect(now);
                        return Some(DisconnectReason::HealthCheck);
                    }
                }
            }

            // Heartbeat emission, one probe in flight at a time.
            let due = conn
                .last_heartbeat
                .map_or(true, |at| now.saturating_duration_since(at) >= interval);
            if due && conn.outstanding_probe.is_none() {
                let timestamp_ms = now_millis();
                let sequence = conn.next_ping_sequence();
                let bytes = WireMessage::Heartbeat { timestamp_ms }.encode(sequence);
                match shared.channel.lock().send(&bytes, false) {
                    Ok(()) => {
                        conn.last_heartbeat = Some(now);
                        conn.outstanding_probe = Some(Probe {
                            timestamp_ms,
                            sent_at: now,
                        });
                        shared.diag.write().record_ping_sent();
                        trace!("heartbeat {sequence} sent");
                    }
                    Err(err) => debug!("heartbeat not sent: {err}"),
                }
            }

            // Replay a bounded batch of queued traffic, paced so replay
            // never starves live sends.
            let mut queue = shared.queue.write();
            if !queue.is_empty() && queue.replay_due(now) {
                queue.evict_expired(now);
                let mut channel = shared.channel.lock();
                let mut replayed = 0usize;
                while replayed < replay_batch {
                    let Some(packet) = queue.pop_next() else { break };
                    if let Err(err) = channel.send(&packet.payload, packet.reliable) {
                        warn!("queued packet dropped on replay: {err}");
                        break;
                    }
                    replayed += 1;
                }
                if replayed > 0 {
                    debug!("replayed {replayed} queued packet(s)");
                }
                queue.note_replay(replay_pause, now);
            }

            None
        });

        if let Ok(Some(reason)) = handle.join() {
            self.fire_disconnect(reason);
        }
    }

    /// Temporarily relax failure detection and backpressure ahead of an
    /// operation known to cause a burst of silence (loading a new area).
    /// The health-check timeout is multiplied and the outbound queue is
    /// trimmed to High/Critical traffic; both restore automatically after a
    /// fixed window.
    pub fn prepare_for_transition(&self) {
        let shared = Arc::clone(&self.shared);
        let resources = [self.res.connection.clone(), self.res.queue.clone()];
        let handle = self.sched.schedule(&resources, move || {
            let now = Instant::now();
            shared.conn.write().relief_until = Some(now + RELIEF_WINDOW);
            let shed = shared
                .queue
                .write()
                .retain_priority_at_least(SendPriority::High);
            info!("zone transition prepared: timeouts relaxed, {shed} queued entries shed");
        });
        let _ = handle.join();
    }

    // ---- configuration and introspection --------------------------------

    /// Switch the bandwidth-allocation profile.
    pub fn set_priority_mode(&self, mode: PriorityMode) {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .sched
            .schedule(std::slice::from_ref(&self.res.bandwidth), move || {
                shared.shaper.write().set_mode(mode, Instant::now());
            });
        let _ = handle.join();
    }

    /// Apply a throttle level (0–5) as if the server had requested it.
    pub fn set_throttle_level(&self, level: u8) {
        self.apply_throttle(level);
    }

    /// Current throttle level.
    pub fn throttle_level(&self) -> u8 {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.bandwidth), move || {
                shared.shaper.read().throttle_level()
            })
            .join()
            .unwrap_or(0)
    }

    /// Install or replace one message-classification rule.
    pub fn set_message_rule(&self, rule: MessageRule) {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .sched
            .schedule(std::slice::from_ref(&self.res.table), move || {
                shared.table.write().set_rule(rule);
            });
        let _ = handle.join();
    }

    /// Snapshot the diagnostics aggregate.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.diagnostics), move || {
                shared.diag.read().snapshot()
            })
            .join()
            .unwrap_or_default()
    }

    /// Best-effort diagnostics snapshot for housekeeping displays.
    ///
    /// Uses the scheduler's bounded try-acquire: if the diagnostics
    /// resource stays contended past `timeout`, this cycle is skipped
    /// (`None`) rather than stalling the caller.
    pub fn try_diagnostics(&self, timeout: Duration) -> Option<DiagnosticsSnapshot> {
        let shared = Arc::clone(&self.shared);
        self.sched
            .try_schedule(
                std::slice::from_ref(&self.res.diagnostics),
                timeout,
                move || shared.diag.read().snapshot(),
            )
            .join()
            .ok()
    }

    /// Clear the diagnostics aggregate (explicit user action only).
    pub fn reset_diagnostics(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .sched
            .schedule(std::slice::from_ref(&self.res.diagnostics), move || {
                shared.diag.write().reset();
            });
        let _ = handle.join();
    }

    /// Current lifecycle state, with the reconnect overlay reported as
    /// `Reconnecting`.
    pub fn connection_state(&self) -> ConnectionState {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.connection), move || {
                let conn = shared.conn.read();
                if conn.reconnecting && conn.state != ConnectionState::Connected {
                    ConnectionState::Reconnecting
                } else {
                    conn.state
                }
            })
            .join()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Whether the connection is currently flagged degraded.
    pub fn is_degraded(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.connection), move || {
                shared.conn.read().degraded
            })
            .join()
            .unwrap_or(false)
    }

    /// Session id assigned by the server, once authenticated.
    pub fn session_id(&self) -> Option<u32> {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.connection), move || {
                shared.conn.read().session_id
            })
            .join()
            .unwrap_or(None)
    }

    /// Entries currently held in the outbound queue.
    pub fn queued_len(&self) -> usize {
        let shared = Arc::clone(&self.shared);
        self.sched
            .schedule_read(std::slice::from_ref(&self.res.queue), move || {
                shared.queue.read().len()
            })
            .join()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn test_config() -> NetConfig {
        NetConfig {
            server_addr: "127.0.0.1:7777".to_string(),
            ..NetConfig::default()
        }
    }

    fn transport() -> (NetTransport, crate::channel::MemoryPeer) {
        let (channel, peer) = MemoryChannel::pair();
        let transport = NetTransport::new(
            test_config(),
            Box::new(channel),
            Scheduler::immediate(),
        )
        .expect("config rejected");
        (transport, peer)
    }

    #[test]
    fn backoff_sequence_matches_the_contract() {
        assert_eq!(reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(4), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(5), Duration::from_secs(16));
        // Capped from here on.
        assert_eq!(reconnect_backoff(6), Duration::from_secs(30));
        assert_eq!(reconnect_backoff(12), Duration::from_secs(30));
    }

    #[test]
    fn invalid_address_is_rejected_at_construction() {
        let (channel, _peer) = MemoryChannel::pair();
        let cfg = NetConfig {
            server_addr: "not an address".to_string(),
            ..NetConfig::default()
        };
        let result = NetTransport::new(cfg, Box::new(channel), Scheduler::immediate());
        assert!(matches!(result, Err(NetError::InvalidConfig(_))));
    }

    #[test]
    fn connect_reaches_connected_state() {
        let (transport, _peer) = transport();
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        transport.connect_blocking().expect("connect failed");
        assert_eq!(transport.connection_state(), ConnectionState::Connected);

        // A second connect while connected is refused, not stacked.
        assert!(matches!(
            transport.connect_blocking(),
            Err(NetError::Busy)
        ));
    }

    #[test]
    fn disconnect_sends_notice_and_resets() {
        let (transport, peer) = transport();
        transport.connect_blocking().expect("connect failed");
        transport.disconnect_blocking().expect("disconnect failed");
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

        let frames = peer.drain();
        let notice = frames
            .iter()
            .find_map(|frame| Packet::decode(&frame.data))
            .expect("no disconnect notice");
        assert!(matches!(notice.message, WireMessage::Disconnect { .. }));

        // Disconnecting again is a no-op.
        transport.disconnect_blocking().expect("second disconnect");
    }

    #[test]
    fn auth_response_stores_the_session() {
        let (transport, _peer) = transport();
        transport.connect_blocking().expect("connect failed");

        transport.dispatch_message(WireMessage::AuthResponse {
            accepted: true,
            message: "welcome".to_string(),
            session_id: 77,
        });
        assert_eq!(transport.session_id(), Some(77));

        transport.dispatch_message(WireMessage::AuthResponse {
            accepted: false,
            message: "bad password".to_string(),
            session_id: 0,
        });
        assert_eq!(transport.session_id(), None);
    }

    #[test]
    fn server_throttle_command_is_applied_not_forwarded() {
        let (transport, peer) = transport();
        transport.connect_blocking().expect("connect failed");

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&forwarded);
        transport.on_message(move |message| seen.lock().push(message));

        let command = WireMessage::Command {
            name: "throttle".to_string(),
            args: vec!["4".to_string()],
        };
        peer.inject_data(command.encode(1));
        transport.poll();

        assert_eq!(transport.throttle_level(), 4);
        assert!(forwarded.lock().is_empty());
    }

    #[test]
    fn chat_messages_reach_the_app_handler() {
        let (transport, peer) = transport();
        transport.connect_blocking().expect("connect failed");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.on_message(move |message| sink.lock().push(message));

        let chat = WireMessage::ChatMessage {
            sender: "brin".to_string(),
            text: "hello".to_string(),
        };
        peer.inject_data(chat.encode(5));
        transport.poll();

        assert_eq!(received.lock().as_slice(), &[chat]);
    }

    #[test]
    fn non_protocol_bytes_fall_back_to_the_raw_handler() {
        let (transport, peer) = transport();
        transport.connect_blocking().expect("connect failed");

        let raw = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&raw);
        transport.on_raw(move |bytes| sink.lock().push(bytes));

        peer.inject_data(b"GARBAGE".to_vec());
        transport.poll();

        assert_eq!(raw.lock().as_slice(), &[b"GARBAGE".to_vec()]);
    }

    #[test]
    fn try_diagnostics_snapshots_without_contention() {
        let (transport, _peer) = transport();
        let snapshot = transport.try_diagnostics(Duration::from_millis(10));
        assert!(snapshot.is_some());
        assert_eq!(snapshot.unwrap().pings_sent, 0);
    }

    #[test]
    fn inbound_legacy_text_is_translated() {
        let (transport, peer) = transport();
        transport.connect_blocking().expect("connect failed");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.on_message(move |message| sink.lock().push(message));

        peer.inject_data(b"CHAT:old client says hi".to_vec());
        transport.poll();

        assert_eq!(
            received.lock().as_slice(),
            &[WireMessage::ChatMessage {
                sender: String::new(),
                text: "old client says hi".to_string(),
            }]
        );
    }
}
