//! ironveil - demo shell for the networking stack
//!
//! Two modes: `ironveil client [addr]` connects to a server, authenticates,
//! says hello, and prints diagnostics; `ironveil listen [addr]` runs a
//! loopback server that answers heartbeats and echoes chat, so the whole
//! stack can be exercised end-to-end on one machine.

use anyhow::{Context, Result};
use ironveil_net::{
    ChannelEvent, NetConfig, NetTransport, QuicChannel, QuicListener, QuicServerConn,
};
use ironveil_sched::Scheduler;
use ironveil_wire::{Packet, WireMessage};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/net.toml";

/// Workers for the transport's scheduler; blocking lifecycle helpers occupy
/// one and schedule state tasks onto the others.
const SCHED_WORKERS: usize = 4;

fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ironveil v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "client".to_string());
    let addr_override = args.next();

    let mut cfg = NetConfig::load_from_path(Path::new(CONFIG_PATH));
    if let Some(addr) = addr_override {
        cfg.server_addr = addr;
    }

    match mode.as_str() {
        "client" => run_client(cfg),
        "listen" => run_listener(&cfg.server_addr),
        other => {
            eprintln!("unknown mode {other:?}; use `client` or `listen`");
            std::process::exit(2);
        }
    }
}

fn run_client(cfg: NetConfig) -> Result<()> {
    let sched = Scheduler::pooled(SCHED_WORKERS);
    let channel = QuicChannel::new().context("failed to create QUIC channel")?;
    let transport = NetTransport::new(cfg, Box::new(channel), sched)
        .context("invalid network configuration")?;

    transport.on_disconnect(|reason| warn!("connection lost: {reason:?}"));
    transport.on_message(|message| info!("server says: {message:?}"));
    transport.on_raw(|bytes| warn!("non-protocol payload ({} bytes)", bytes.len()));

    transport
        .connect_blocking()
        .context("could not reach the server")?;
    transport.authenticate("demo", "demo");
    transport.send(
        WireMessage::ChatMessage {
            sender: String::new(),
            text: "hello from ironveil".to_string(),
        },
        true,
    );

    // Drive the transport for a few seconds, then report.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut next_report = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        transport.poll();
        transport.tick();
        if Instant::now() >= next_report {
            next_report += Duration::from_secs(2);
            // Best-effort: skip the report rather than stall the loop.
            if let Some(diag) = transport.try_diagnostics(Duration::from_millis(5)) {
                info!(
                    "ping {:.1}ms, jitter {:.1}ms, loss {:.1}%",
                    diag.ping_avg_ms, diag.jitter_ms, diag.loss_percent
                );
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let diag = transport.diagnostics();
    info!(
        "ping avg {:.1}ms (min {:.1} / max {:.1}), jitter {:.1}ms, loss {:.1}%",
        diag.ping_avg_ms, diag.ping_min_ms, diag.ping_max_ms, diag.jitter_ms, diag.loss_percent
    );

    let _ = transport.disconnect_blocking();
    Ok(())
}

fn run_listener(addr: &str) -> Result<()> {
    let addr = addr.parse().context("invalid listen address")?;
    let listener = QuicListener::bind(addr).context("failed to bind listener")?;
    info!("listening on {}", listener.local_addr());

    loop {
        match listener.accept(Duration::from_secs(3_600)) {
            Ok(conn) => {
                std::thread::spawn(move || serve(conn));
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
}

fn serve(conn: QuicServerConn) {
    info!("client connected from {}", conn.remote_address());
    let mut sequence = 0u32;
    loop {
        for event in conn.poll(32) {
            match event {
                ChannelEvent::Data(bytes) => {
                    let Some(packet) = Packet::decode(&bytes) else {
                        warn!("ignoring {} non-protocol bytes", bytes.len());
                        continue;
                    };
                    if let Some((reply, reliable)) = respond(packet.message) {
                        sequence = sequence.wrapping_add(1);
                        if conn.send(&reply.encode(sequence), reliable).is_err() {
                            return;
                        }
                    }
                }
                ChannelEvent::Disconnected => {
                    info!("client gone");
                    return;
                }
                ChannelEvent::Connected => {}
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// The loopback server's whole personality: echo probes, accept anyone,
/// repeat chat back.
fn respond(message: WireMessage) -> Option<(WireMessage, bool)> {
    match message {
        WireMessage::Heartbeat { timestamp_ms } => {
            Some((WireMessage::Heartbeat { timestamp_ms }, false))
        }
        WireMessage::AuthRequest { username, .. } => Some((
            WireMessage::AuthResponse {
                accepted: true,
                message: format!("welcome, {username}"),
                session_id: 1,
            },
            true,
        )),
        WireMessage::ChatMessage { sender, text } => Some((
            WireMessage::ChatMessage {
                sender: if sender.is_empty() {
                    "echo".to_string()
                } else {
                    sender
                },
                text,
            },
            true,
        )),
        WireMessage::Disconnect { reason } => {
            info!("client disconnecting: {reason}");
            None
        }
        other => {
            info!("no reply for {}", other.label());
            None
        }
    }
}
