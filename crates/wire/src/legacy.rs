//! Translation of the colon-prefixed text sub-protocol.
//!
//! An older tooling path speaks plain text frames such as `AUTH:name:pass`
//! or `CHAT:hello`. These are accepted at the enqueue boundary and
//! translated into the equivalent [`WireMessage`] so that the outbound queue
//! and replay logic only ever deal with the framed binary form.

use crate::message::WireMessage;

const PREFIXES: [&str; 6] = ["AUTH:", "PING:", "POSITION:", "MOVE_DELTA:", "CHAT:", "COMMAND:"];

/// Whether `bytes` starts with one of the known legacy text prefixes.
pub fn is_legacy_frame(bytes: &[u8]) -> bool {
    PREFIXES
        .iter()
        .any(|prefix| bytes.starts_with(prefix.as_bytes()))
}

/// Parse a legacy text frame into the equivalent wire message.
///
/// Returns `None` for anything that is not a well-formed legacy frame;
/// callers fall back to raw handling, mirroring [`crate::Packet::decode`].
pub fn parse_legacy(text: &str) -> Option<WireMessage> {
    let (prefix, rest) = text.split_once(':')?;
    match prefix {
        "AUTH" => {
            let (username, password) = rest.split_once(':')?;
            if username.is_empty() {
                return None;
            }
            Some(WireMessage::AuthRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
        }
        "PING" => Some(WireMessage::Heartbeat {
            timestamp_ms: rest.parse().ok()?,
        }),
        "POSITION" => {
            let mut parts = rest.split(':');
            let x = parts.next()?.parse().ok()?;
            let y = parts.next()?.parse().ok()?;
            let z = parts.next()?.parse().ok()?;
            // The heading component is a later addition; old senders omit it.
            let heading = match parts.next() {
                Some(value) => value.parse().ok()?,
                None => 0.0,
            };
            if parts.next().is_some() {
                return None;
            }
            Some(WireMessage::PositionUpdate { x, y, z, heading })
        }
        "MOVE_DELTA" => {
            let mut parts = rest.split(':');
            let dx = parts.next()?.parse().ok()?;
            let dy = parts.next()?.parse().ok()?;
            let dz = parts.next()?.parse().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(WireMessage::DeltaPositionUpdate {
                dx,
                dy,
                dz,
                heading: 0,
            })
        }
        "CHAT" => Some(WireMessage::ChatMessage {
            sender: String::new(),
            text: rest.to_string(),
        }),
        "COMMAND" => {
            let mut parts = rest.split(':');
            let name = parts.next()?.to_string();
            if name.is_empty() {
                return None;
            }
            Some(WireMessage::Command {
                name,
                args: parts.map(str::to_string).collect(),
            })
        }
        _ => None,
    }
}
