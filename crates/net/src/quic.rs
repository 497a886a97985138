//! QUIC-backed raw channel using quinn.
//!
//! QUIC gives the two delivery modes the transport needs: unidirectional
//! streams carry reliable packets (one framed packet per stream) and QUIC
//! datagrams carry fire-and-forget traffic. The async machinery stays behind
//! a blocking facade: each channel owns a small tokio runtime and every call
//! is bounded by a wall-clock timeout, so the transport core remains a plain
//! thread/worker system.
//!
//! TLS uses self-signed certificates and a skip-verify client
//! (development only).

use crate::channel::{ChannelError, ChannelEvent, RawChannel};
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Upper bound on a single reliable packet read from a stream.
const MAX_STREAM_PACKET: usize = 256 * 1024;

/// Wall-clock slice one poll iteration may spend waiting on the runtime.
const POLL_SLICE: Duration = Duration::from_millis(1);

const ALPN: &[u8] = b"ironveil";

fn new_runtime() -> Result<Runtime, ChannelError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| ChannelError::Transport(format!("tokio runtime: {err}")))
}

fn transport_err(context: &str, err: impl std::fmt::Display) -> ChannelError {
    ChannelError::Transport(format!("{context}: {err}"))
}

enum PollStep {
    Event(ChannelEvent),
    Idle,
    Lost,
}

/// One bounded wait for the next inbound event on `connection`.
fn poll_step(runtime: &Runtime, connection: &Connection) -> PollStep {
    runtime.block_on(async {
        tokio::select! {
            datagram = connection.read_datagram() => match datagram {
                Ok(bytes) => PollStep::Event(ChannelEvent::Data(bytes.to_vec())),
                Err(_) => PollStep::Lost,
            },
            stream = connection.accept_uni() => match stream {
                Ok(mut stream) => match stream.read_to_end(MAX_STREAM_PACKET).await {
                    Ok(bytes) => PollStep::Event(ChannelEvent::Data(bytes)),
                    Err(err) => {
                        warn!("dropping unreadable stream: {err}");
                        PollStep::Idle
                    }
                },
                Err(_) => PollStep::Lost,
            },
            _ = tokio::time::sleep(POLL_SLICE) => PollStep::Idle,
        }
    })
}

fn drain_events(runtime: &Runtime, connection: &Connection, max_events: usize) -> (Vec<ChannelEvent>, bool) {
    let mut events = Vec::new();
    let mut lost = false;
    while events.len() < max_events {
        match poll_step(runtime, connection) {
            PollStep::Event(event) => events.push(event),
            PollStep::Idle => break,
            PollStep::Lost => {
                events.push(ChannelEvent::Disconnected);
                lost = true;
                break;
            }
        }
    }
    (events, lost)
}

fn send_on(
    runtime: &Runtime,
    connection: &Connection,
    data: &[u8],
    reliable: bool,
) -> Result<(), ChannelError> {
    if reliable {
        runtime.block_on(async {
            let mut stream = connection
                .open_uni()
                .await
                .map_err(|err| transport_err("open stream", err))?;
            stream
                .write_all(data)
                .await
                .map_err(|err| transport_err("write stream", err))?;
            stream
                .finish()
                .map_err(|err| transport_err("finish stream", err))?;
            Ok(())
        })
    } else {
        connection
            .send_datagram(data.to_vec().into())
            .map_err(|err| transport_err("send datagram", err))
    }
}

/// Client-side QUIC channel.
pub struct QuicChannel {
    runtime: Runtime,
    endpoint: Endpoint,
    connection: Option<Connection>,
}

impl QuicChannel {
    /// Create a client channel bound to an ephemeral local port.
    ///
    /// Accepts any server certificate (development only).
    pub fn new() -> Result<Self, ChannelError> {
        let runtime = new_runtime()?;

        // Install default crypto provider if not already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut client_crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|err| transport_err("client crypto", err))?,
        ));

        // Endpoint creation needs the runtime's reactor.
        let _guard = runtime.enter();
        let mut endpoint = Endpoint::client(
            "0.0.0.0:0"
                .parse()
                .expect("static socket address must parse"),
        )
        .map_err(|err| transport_err("bind client endpoint", err))?;
        endpoint.set_default_client_config(client_config);
        drop(_guard);

        debug!("client endpoint created");
        Ok(Self {
            runtime,
            endpoint,
            connection: None,
        })
    }
}

impl RawChannel for QuicChannel {
    fn connect(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), ChannelError> {
        if let Some(stale) = self.connection.take() {
            stale.close(0u32.into(), b"reconnecting");
        }

        // Initiating a connection needs the runtime's reactor.
        let _guard = self.runtime.enter();
        let connecting = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|err| transport_err("initiate connect", err))?;

        let connection = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, connecting).await });

        match connection {
            Err(_) => Err(ChannelError::ConnectTimeout(timeout)),
            Ok(Err(err)) => Err(transport_err("establish connection", err)),
            Ok(Ok(connection)) => {
                info!("connected to {addr}");
                self.connection = Some(connection);
                Ok(())
            }
        }
    }

    fn disconnect(&mut self, timeout: Duration) {
        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"disconnect");
            // Bounded wait for the close frame to flush.
            let endpoint = self.endpoint.clone();
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(timeout, endpoint.wait_idle()).await });
        }
    }

    fn send(&mut self, data: &[u8], reliable: bool) -> Result<(), ChannelError> {
        let connection = self.connection.as_ref().ok_or(ChannelError::NotConnected)?;
        send_on(&self.runtime, connection, data, reliable)
    }

    fn poll(&mut self, max_events: usize) -> Vec<ChannelEvent> {
        let Some(connection) = self.connection.clone() else {
            return Vec::new();
        };
        let (events, lost) = drain_events(&self.runtime, &connection, max_events);
        if lost {
            self.connection = None;
        }
        events
    }

    fn is_open(&self) -> bool {
        self.connection.is_some()
    }
}

/// Server endpoint accepting QUIC connections (loopback listener and tests).
pub struct QuicListener {
    runtime: Arc<Runtime>,
    endpoint: Endpoint,
    addr: SocketAddr,
}

impl QuicListener {
    /// Bind a listener with a freshly generated self-signed certificate.
    pub fn bind(addr: SocketAddr) -> Result<Self, ChannelError> {
        let runtime = Arc::new(new_runtime()?);

        let _ = rustls::crypto::ring::default_provider().install_default();

        let (cert, key) = generate_self_signed_cert()?;
        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|err| transport_err("server crypto", err))?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|err| transport_err("server crypto", err))?,
        ));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
        server_config.transport_config(Arc::new(transport_config));

        let _guard = runtime.enter();
        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|err| transport_err("bind server endpoint", err))?;
        drop(_guard);

        let actual_addr = endpoint
            .local_addr()
            .map_err(|err| transport_err("local addr", err))?;
        info!("listener bound to {actual_addr}");

        Ok(Self {
            runtime,
            endpoint,
            addr: actual_addr,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept the next connection within `timeout`.
    pub fn accept(&self, timeout: Duration) -> Result<QuicServerConn, ChannelError> {
        let accepted = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                match self.endpoint.accept().await {
                    Some(incoming) => incoming
                        .await
                        .map_err(|err| transport_err("accept connection", err)),
                    None => Err(ChannelError::Transport("endpoint closed".to_string())),
                }
            })
            .await
        });

        match accepted {
            Err(_) => Err(ChannelError::ConnectTimeout(timeout)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(connection)) => {
                info!("accepted connection from {}", connection.remote_address());
                Ok(QuicServerConn {
                    runtime: Arc::clone(&self.runtime),
                    connection,
                })
            }
        }
    }

    /// Close the endpoint, rejecting new connections.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener shutting down");
    }
}

/// Server side of one accepted connection.
pub struct QuicServerConn {
    runtime: Arc<Runtime>,
    connection: Connection,
}

impl QuicServerConn {
    /// Send one payload to the client.
    pub fn send(&self, data: &[u8], reliable: bool) -> Result<(), ChannelError> {
        send_on(&self.runtime, &self.connection, data, reliable)
    }

    /// Drain up to `max_events` inbound events without blocking.
    pub fn poll(&self, max_events: usize) -> Vec<ChannelEvent> {
        let (events, _lost) = drain_events(&self.runtime, &self.connection, max_events);
        events
    }

    /// The client's address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection.
    pub fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
    }
}

/// Generate a self-signed certificate for development use.
///
/// **WARNING:** insecure; development/testing only.
fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), ChannelError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|err| transport_err("generate certificate", err))?;

    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let cert_der = CertificateDer::from(cert.cert);
    Ok((cert_der, key))
}

/// Certificate verifier that accepts all certificates (development only).
///
/// **WARNING:** bypasses TLS security; NEVER use in production.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn poll_until_data(channel: &mut dyn RawChannel, deadline: Duration) -> Option<Vec<u8>> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            for event in channel.poll(8) {
                if let ChannelEvent::Data(bytes) = event {
                    return Some(bytes);
                }
            }
        }
        None
    }

    #[test]
    fn reliable_roundtrip() {
        let listener =
            QuicListener::bind("127.0.0.1:0".parse().unwrap()).expect("failed to bind listener");
        let server_addr = listener.local_addr();

        let server = std::thread::spawn(move || {
            let conn = listener
                .accept(Duration::from_secs(5))
                .expect("no incoming connection");

            // Wait for the client's packet, then echo it back.
            let start = Instant::now();
            loop {
                assert!(start.elapsed() < Duration::from_secs(5), "no data received");
                let events = conn.poll(8);
                if let Some(ChannelEvent::Data(bytes)) = events
                    .iter()
                    .find(|event| matches!(event, ChannelEvent::Data(_)))
                {
                    conn.send(bytes, true).expect("echo failed");
                    break;
                }
            }
            // Keep the connection alive long enough for the echo to land.
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut client = QuicChannel::new().expect("failed to create client");
        client
            .connect(server_addr, Duration::from_secs(5))
            .expect("connect failed");
        assert!(client.is_open());

        client.send(b"hello over quic", true).expect("send failed");
        let echoed =
            poll_until_data(&mut client, Duration::from_secs(5)).expect("no echo received");
        assert_eq!(echoed, b"hello over quic");

        client.disconnect(Duration::from_millis(500));
        assert!(!client.is_open());
        server.join().expect("server thread panicked");
    }

    #[test]
    fn connect_to_dead_port_fails() {
        let mut client = QuicChannel::new().expect("failed to create client");
        // Port 1 on localhost has nothing listening; the bounded connect
        // must come back as a timeout or transport error, not hang.
        let result = client.connect(
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(500),
        );
        assert!(result.is_err());
        assert!(!client.is_open());
    }
}
