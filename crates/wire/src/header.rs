//! The fixed packet header shared by every message variant.

use crate::message::MessageKind;
use thiserror::Error;

/// Magic constant identifying an ironveil protocol packet ("IRVL" on the wire).
pub const WIRE_MAGIC: u32 = u32::from_le_bytes(*b"IRVL");

/// Current protocol version. Peers running any version up to and including
/// this one are accepted; newer versions are rejected.
pub const WIRE_VERSION: u16 = 2;

/// Byte length of the packed header: magic(4) + version(2) + kind(1) +
/// length(4) + sequence(4).
pub const HEADER_LEN: usize = 15;

/// Hard cap on payload size, rejected before any payload parsing or
/// allocation happens. Sized so a maximum-length string field plus its
/// prefix still fits.
pub const MAX_PAYLOAD_LEN: usize = 128 * 1024;

/// Why a packet was rejected. Used for logging; the public decode surface
/// collapses all of these to "not a protocol packet".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The magic constant did not match.
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    /// The sender speaks a newer protocol than we do.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    /// The type tag is outside the known range.
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    /// The input ended before the declared length.
    #[error("packet truncated")]
    Truncated,
    /// The declared payload length does not match the bytes present.
    #[error("declared payload length {declared} but {actual} bytes present")]
    LengthMismatch {
        /// Length field from the header.
        declared: usize,
        /// Bytes actually available after the header.
        actual: usize,
    },
    /// The payload did not deserialize to exactly the declared length.
    #[error("payload has {0} undecoded trailing bytes")]
    TrailingBytes(usize),
    /// The declared payload length exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload length {0} exceeds the cap")]
    Oversized(usize),
}

/// Parsed packet header.
///
/// A header is valid iff the magic matches, the version is at most
/// [`WIRE_VERSION`], and the type tag is within the known range. Anything
/// else rejects the whole packet before payload parsing is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version the sender encoded with.
    pub version: u16,
    /// Message type tag.
    pub kind: MessageKind,
    /// Exact payload byte count (header excluded).
    pub length: u32,
    /// Sender-assigned sequence number.
    pub sequence: u32,
}

impl Header {
    /// Serialize the header into `buf` in the fixed wire layout.
    pub(crate) fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    /// Parse and validate the leading [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version > WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let kind = MessageKind::try_from(bytes[6])?;

        let length = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        if length as usize > MAX_PAYLOAD_LEN {
            return Err(WireError::Oversized(length as usize));
        }

        let sequence = u32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]);

        Ok(Self {
            version,
            kind,
            length,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            version: WIRE_VERSION,
            kind: MessageKind::ChatMessage,
            length: 12,
            sequence: 77,
        }
    }

    #[test]
    fn header_roundtrips() {
        let mut buf = Vec::new();
        sample().write(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(Header::parse(&buf), Ok(sample()));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        sample().write(&mut buf);
        buf[0] ^= 0xFF;
        assert!(matches!(Header::parse(&buf), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut buf = Vec::new();
        Header {
            version: WIRE_VERSION + 1,
            ..sample()
        }
        .write(&mut buf);
        assert_eq!(
            Header::parse(&buf),
            Err(WireError::UnsupportedVersion(WIRE_VERSION + 1))
        );
    }

    #[test]
    fn older_version_is_accepted() {
        let mut buf = Vec::new();
        Header {
            version: 1,
            ..sample()
        }
        .write(&mut buf);
        assert!(Header::parse(&buf).is_ok());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = Vec::new();
        sample().write(&mut buf);
        buf[6] = 0xEE;
        assert_eq!(Header::parse(&buf), Err(WireError::UnknownKind(0xEE)));
    }

    #[test]
    fn short_input_is_truncated() {
        let mut buf = Vec::new();
        sample().write(&mut buf);
        buf.truncate(HEADER_LEN - 1);
        assert_eq!(Header::parse(&buf), Err(WireError::Truncated));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        Header {
            length: (MAX_PAYLOAD_LEN as u32) + 1,
            ..sample()
        }
        .write(&mut buf);
        assert!(matches!(Header::parse(&buf), Err(WireError::Oversized(_))));
    }
}
