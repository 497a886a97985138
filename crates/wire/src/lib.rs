#![warn(missing_docs)]
//! Versioned binary wire protocol with a closed set of typed messages.
//!
//! Every packet is a fixed little-endian header followed by a type-specific
//! payload. [`Packet::decode`] is the single deserialization entry point used
//! by all callers: it validates the header, dispatches on the type tag, and
//! returns `None` for anything that is not a well-formed protocol packet so
//! callers can fall back to legacy/raw handling.

mod codec;
mod header;
mod legacy;
mod message;

pub use header::{Header, WireError, HEADER_LEN, MAX_PAYLOAD_LEN, WIRE_MAGIC, WIRE_VERSION};
pub use legacy::{is_legacy_frame, parse_legacy};
pub use message::{MessageKind, Packet, WireMessage};
