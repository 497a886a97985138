//! The closed set of protocol messages and their payload codecs.

use crate::codec::{ByteReader, ByteWriter};
use crate::header::{Header, WireError, HEADER_LEN, MAX_PAYLOAD_LEN, WIRE_VERSION};
use tracing::debug;

/// Message type tags. The byte values are stable on the wire and must not be
/// renumbered without a protocol version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Liveness probe carrying the sender's local clock.
    Heartbeat = 0x00,
    /// Orderly connection teardown.
    Disconnect = 0x01,
    /// Credential presentation (sent in the clear; a known weakness).
    AuthRequest = 0x10,
    /// Server verdict on an AuthRequest.
    AuthResponse = 0x11,
    /// New-account creation.
    Registration = 0x12,
    /// Absolute position report.
    PositionUpdate = 0x20,
    /// Quantized position delta.
    DeltaPositionUpdate = 0x21,
    /// Server-driven position override.
    Teleport = 0x22,
    /// Player chat line.
    ChatMessage = 0x30,
    /// Server announcement.
    SystemMessage = 0x31,
    /// Private player-to-player chat.
    Whisper = 0x32,
    /// Slash-command invocation.
    Command = 0x40,
    /// Opaque world snapshot blob.
    WorldState = 0x50,
}

impl MessageKind {
    /// Short label for this kind, shared with the legacy text protocol and
    /// used as the match key for message classification rules.
    pub fn label(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "PING",
            MessageKind::Disconnect => "DISCONNECT",
            MessageKind::AuthRequest => "AUTH",
            MessageKind::AuthResponse => "AUTH_RESULT",
            MessageKind::Registration => "REGISTER",
            MessageKind::PositionUpdate => "POSITION",
            MessageKind::DeltaPositionUpdate => "MOVE_DELTA",
            MessageKind::Teleport => "TELEPORT",
            MessageKind::ChatMessage => "CHAT",
            MessageKind::SystemMessage => "SYSTEM",
            MessageKind::Whisper => "WHISPER",
            MessageKind::Command => "COMMAND",
            MessageKind::WorldState => "WORLD_STATE",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x00 => Ok(MessageKind::Heartbeat),
            0x01 => Ok(MessageKind::Disconnect),
            0x10 => Ok(MessageKind::AuthRequest),
            0x11 => Ok(MessageKind::AuthResponse),
            0x12 => Ok(MessageKind::Registration),
            0x20 => Ok(MessageKind::PositionUpdate),
            0x21 => Ok(MessageKind::DeltaPositionUpdate),
            0x22 => Ok(MessageKind::Teleport),
            0x30 => Ok(MessageKind::ChatMessage),
            0x31 => Ok(MessageKind::SystemMessage),
            0x32 => Ok(MessageKind::Whisper),
            0x40 => Ok(MessageKind::Command),
            0x50 => Ok(MessageKind::WorldState),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// One case per protocol message. Immutable after construction; a message
/// has no identity beyond its contents.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Liveness probe; `timestamp_ms` is the sender's local clock and is
    /// echoed back verbatim so the sender can measure round-trip time.
    Heartbeat {
        /// Sender's local clock, milliseconds.
        timestamp_ms: u64,
    },
    /// Orderly teardown notice.
    Disconnect {
        /// Human-readable reason.
        reason: String,
    },
    /// Credential presentation.
    AuthRequest {
        /// Account name.
        username: String,
        /// Password, clear text over the reliable channel.
        password: String,
    },
    /// Server verdict on authentication.
    AuthResponse {
        /// Whether the credentials were accepted.
        accepted: bool,
        /// Verdict detail or rejection reason.
        message: String,
        /// Session identifier assigned on success (0 when rejected).
        session_id: u32,
    },
    /// New-account creation request.
    Registration {
        /// Desired account name.
        username: String,
        /// Password, clear text.
        password: String,
        /// Contact address.
        email: String,
    },
    /// Absolute position report.
    PositionUpdate {
        /// World X.
        x: f32,
        /// World Y.
        y: f32,
        /// World Z.
        z: f32,
        /// Facing, degrees.
        heading: f32,
    },
    /// Quantized position delta (1/16-unit steps).
    DeltaPositionUpdate {
        /// X delta in 1/16-unit steps.
        dx: i16,
        /// Y delta in 1/16-unit steps.
        dy: i16,
        /// Z delta in 1/16-unit steps.
        dz: i16,
        /// Facing quantized to 256 steps.
        heading: u8,
    },
    /// Server-driven position override.
    Teleport {
        /// World X.
        x: f32,
        /// World Y.
        y: f32,
        /// World Z.
        z: f32,
        /// Facing, degrees.
        heading: f32,
    },
    /// Player chat line.
    ChatMessage {
        /// Sender name; empty for messages originating locally.
        sender: String,
        /// Message text.
        text: String,
    },
    /// Server announcement.
    SystemMessage {
        /// Announcement text.
        text: String,
    },
    /// Private message.
    Whisper {
        /// Sender name.
        from: String,
        /// Recipient name.
        to: String,
        /// Message text.
        text: String,
    },
    /// Slash-command invocation.
    Command {
        /// Command name.
        name: String,
        /// Positional arguments.
        args: Vec<String>,
    },
    /// Opaque world snapshot.
    WorldState {
        /// Simulation tick the snapshot describes.
        tick: u64,
        /// Snapshot bytes; the transport does not interpret them.
        payload: Vec<u8>,
    },
}

impl WireMessage {
    /// The type tag this message serializes under.
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Heartbeat { .. } => MessageKind::Heartbeat,
            WireMessage::Disconnect { .. } => MessageKind::Disconnect,
            WireMessage::AuthRequest { .. } => MessageKind::AuthRequest,
            WireMessage::AuthResponse { .. } => MessageKind::AuthResponse,
            WireMessage::Registration { .. } => MessageKind::Registration,
            WireMessage::PositionUpdate { .. } => MessageKind::PositionUpdate,
            WireMessage::DeltaPositionUpdate { .. } => MessageKind::DeltaPositionUpdate,
            WireMessage::Teleport { .. } => MessageKind::Teleport,
            WireMessage::ChatMessage { .. } => MessageKind::ChatMessage,
            WireMessage::SystemMessage { .. } => MessageKind::SystemMessage,
            WireMessage::Whisper { .. } => MessageKind::Whisper,
            WireMessage::Command { .. } => MessageKind::Command,
            WireMessage::WorldState { .. } => MessageKind::WorldState,
        }
    }

    /// Classification label, shared with the legacy text protocol.
    pub fn label(&self) -> &'static str {
        self.kind().label()
    }

    /// Serialize into a complete packet: header followed by the payload.
    ///
    /// The header's length field always equals the exact payload byte count.
    pub fn encode(&self, sequence: u32) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write_payload(&mut writer);
        let payload = writer.into_vec();
        assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "payload exceeds the wire cap"
        );

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        Header {
            version: WIRE_VERSION,
            kind: self.kind(),
            length: payload.len() as u32,
            sequence,
        }
        .write(&mut buf);
        buf.extend_from_slice(&payload);
        buf
    }

    fn write_payload(&self, w: &mut ByteWriter) {
        match self {
            WireMessage::Heartbeat { timestamp_ms } => {
                w.put_u64(*timestamp_ms);
            }
            WireMessage::Disconnect { reason } => {
                w.put_str(reason);
            }
            WireMessage::AuthRequest { username, password } => {
                w.put_str(username);
                w.put_str(password);
            }
            WireMessage::AuthResponse {
                accepted,
                message,
                session_id,
            } => {
                w.put_u8(u8::from(*accepted));
                w.put_str(message);
                w.put_u32(*session_id);
            }
            WireMessage::Registration {
                username,
                password,
                email,
            } => {
                w.put_str(username);
                w.put_str(password);
                w.put_str(email);
            }
            WireMessage::PositionUpdate { x, y, z, heading }
            | WireMessage::Teleport { x, y, z, heading } => {
                w.put_f32(*x);
                w.put_f32(*y);
                w.put_f32(*z);
                w.put_f32(*heading);
            }
            WireMessage::DeltaPositionUpdate { dx, dy, dz, heading } => {
                w.put_i16(*dx);
                w.put_i16(*dy);
                w.put_i16(*dz);
                w.put_u8(*heading);
            }
            WireMessage::ChatMessage { sender, text } => {
                w.put_str(sender);
                w.put_str(text);
            }
            WireMessage::SystemMessage { text } => {
                w.put_str(text);
            }
            WireMessage::Whisper { from, to, text } => {
                w.put_str(from);
                w.put_str(to);
                w.put_str(text);
            }
            WireMessage::Command { name, args } => {
                w.put_str(name);
                w.put_str_list(args);
            }
            WireMessage::WorldState { tick, payload } => {
                w.put_u64(*tick);
                w.put_blob(payload);
            }
        }
    }

    fn read_payload(kind: MessageKind, r: &mut ByteReader<'_>) -> Option<Self> {
        let message = match kind {
            MessageKind::Heartbeat => WireMessage::Heartbeat {
                timestamp_ms: r.get_u64()?,
            },
            MessageKind::Disconnect => WireMessage::Disconnect {
                reason: r.get_str()?,
            },
            MessageKind::AuthRequest => WireMessage::AuthRequest {
                username: r.get_str()?,
                password: r.get_str()?,
            },
            MessageKind::AuthResponse => WireMessage::AuthResponse {
                accepted: r.get_u8()? != 0,
                message: r.get_str()?,
                session_id: r.get_u32()?,
            },
            MessageKind::Registration => WireMessage::Registration {
                username: r.get_str()?,
                password: r.get_str()?,
                email: r.get_str()?,
            },
            MessageKind::PositionUpdate => WireMessage::PositionUpdate {
                x: r.get_f32()?,
                y: r.get_f32()?,
                z: r.get_f32()?,
                heading: r.get_f32()?,
            },
            MessageKind::DeltaPositionUpdate => WireMessage::DeltaPositionUpdate {
                dx: r.get_i16()?,
                dy: r.get_i16()?,
                dz: r.get_i16()?,
                heading: r.get_u8()?,
            },
            MessageKind::Teleport => WireMessage::Teleport {
                x: r.get_f32()?,
                y: r.get_f32()?,
                z: r.get_f32()?,
                heading: r.get_f32()?,
            },
            MessageKind::ChatMessage => WireMessage::ChatMessage {
                sender: r.get_str()?,
                text: r.get_str()?,
            },
            MessageKind::SystemMessage => WireMessage::SystemMessage {
                text: r.get_str()?,
            },
            MessageKind::Whisper => WireMessage::Whisper {
                from: r.get_str()?,
                to: r.get_str()?,
                text: r.get_str()?,
            },
            MessageKind::Command => WireMessage::Command {
                name: r.get_str()?,
                args: r.get_str_list()?,
            },
            MessageKind::WorldState => WireMessage::WorldState {
                tick: r.get_u64()?,
                payload: r.get_blob()?,
            },
        };
        Some(message)
    }
}

/// A decoded packet: validated header fields plus the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Sender-assigned sequence number from the header.
    pub sequence: u32,
    /// Protocol version the sender encoded with.
    pub version: u16,
    /// The decoded message.
    pub message: WireMessage,
}

impl Packet {
    /// The single deserialization entry point.
    ///
    /// Validates the header, dispatches on the type tag, and requires the
    /// payload to decode to exactly the header-declared length. Returns
    /// `None` for any unknown, invalid, or truncated input; callers treat
    /// that as "not a protocol packet" and may try legacy/raw handling.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match Self::decode_inner(bytes) {
            Ok(packet) => Some(packet),
            Err(err) => {
                debug!("rejected inbound packet: {err}");
                None
            }
        }
    }

    fn decode_inner(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Header::parse(bytes)?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.length as usize {
            return Err(WireError::LengthMismatch {
                declared: header.length as usize,
                actual: payload.len(),
            });
        }

        let mut reader = ByteReader::new(payload);
        let message =
            WireMessage::read_payload(header.kind, &mut reader).ok_or(WireError::Truncated)?;
        if !reader.is_empty() {
            return Err(WireError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            sequence: header.sequence,
            version: header.version,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: WireMessage) {
        let bytes = message.encode(9);
        let packet = Packet::decode(&bytes).expect("packet rejected");
        assert_eq!(packet.sequence, 9);
        assert_eq!(packet.version, WIRE_VERSION);
        assert_eq!(packet.message, message);
    }

    #[test]
    fn every_variant_roundtrips() {
        roundtrip(WireMessage::Heartbeat { timestamp_ms: 0 });
        roundtrip(WireMessage::Heartbeat {
            timestamp_ms: u64::MAX,
        });
        roundtrip(WireMessage::Disconnect {
            reason: "quit".into(),
        });
        roundtrip(WireMessage::AuthRequest {
            username: "ada".into(),
            password: "hunter2".into(),
        });
        roundtrip(WireMessage::AuthResponse {
            accepted: true,
            message: String::new(),
            session_id: 451,
        });
        roundtrip(WireMessage::Registration {
            username: "ada".into(),
            password: "hunter2".into(),
            email: "ada@example.net".into(),
        });
        roundtrip(WireMessage::PositionUpdate {
            x: -10.25,
            y: 64.0,
            z: 3200.5,
            heading: 359.9,
        });
        roundtrip(WireMessage::DeltaPositionUpdate {
            dx: i16::MIN,
            dy: 0,
            dz: i16::MAX,
            heading: 255,
        });
        roundtrip(WireMessage::Teleport {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            heading: 0.0,
        });
        roundtrip(WireMessage::ChatMessage {
            sender: String::new(),
            text: "hello there".into(),
        });
        roundtrip(WireMessage::SystemMessage {
            text: "server restarting".into(),
        });
        roundtrip(WireMessage::Whisper {
            from: "ada".into(),
            to: "brin".into(),
            text: "psst".into(),
        });
        roundtrip(WireMessage::Command {
            name: "emote".into(),
            args: vec!["wave".into(), String::new()],
        });
        roundtrip(WireMessage::WorldState {
            tick: 123_456,
            payload: vec![0u8, 1, 2, 255],
        });
    }

    #[test]
    fn max_length_string_roundtrips() {
        roundtrip(WireMessage::SystemMessage {
            text: "x".repeat(u16::MAX as usize),
        });
    }

    #[test]
    fn header_length_equals_payload_bytes() {
        let message = WireMessage::ChatMessage {
            sender: "ada".into(),
            text: "hi".into(),
        };
        let bytes = message.encode(1);
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.length as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = WireMessage::ChatMessage {
            sender: "ada".into(),
            text: "hello".into(),
        }
        .encode(1);
        for cut in 0..bytes.len() {
            assert_eq!(Packet::decode(&bytes[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = WireMessage::Heartbeat { timestamp_ms: 5 }.encode(1);
        // Grow the payload and fix up the declared length so only the
        // trailing-byte check can catch it.
        bytes.push(0xAA);
        let new_len = (bytes.len() - HEADER_LEN) as u32;
        bytes[7..11].copy_from_slice(&new_len.to_le_bytes());
        assert_eq!(Packet::decode(&bytes), None);
    }

    #[test]
    fn length_field_mismatch_is_rejected() {
        let mut bytes = WireMessage::Heartbeat { timestamp_ms: 5 }.encode(1);
        bytes.push(0xAA); // extra byte the header does not declare
        assert_eq!(Packet::decode(&bytes), None);
    }

    #[test]
    fn arbitrary_garbage_is_rejected() {
        assert_eq!(Packet::decode(b""), None);
        assert_eq!(Packet::decode(b"AUTH:ada:hunter2"), None);
        assert_eq!(Packet::decode(&[0xFF; 64]), None);
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(MessageKind::Heartbeat as u8, 0x00);
        assert_eq!(MessageKind::Disconnect as u8, 0x01);
        assert_eq!(MessageKind::AuthRequest as u8, 0x10);
        assert_eq!(MessageKind::AuthResponse as u8, 0x11);
        assert_eq!(MessageKind::Registration as u8, 0x12);
        assert_eq!(MessageKind::PositionUpdate as u8, 0x20);
        assert_eq!(MessageKind::DeltaPositionUpdate as u8, 0x21);
        assert_eq!(MessageKind::Teleport as u8, 0x22);
        assert_eq!(MessageKind::ChatMessage as u8, 0x30);
        assert_eq!(MessageKind::SystemMessage as u8, 0x31);
        assert_eq!(MessageKind::Whisper as u8, 0x32);
        assert_eq!(MessageKind::Command as u8, 0x40);
        assert_eq!(MessageKind::WorldState as u8, 0x50);
    }
}
