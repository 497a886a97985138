//! Fuzz-style property tests for the wire codec
//!
//! These tests validate that the packet decoder handles arbitrary
//! network input gracefully without crashing.

use ironveil_wire::{Packet, WireMessage, HEADER_LEN, WIRE_MAGIC};
use proptest::prelude::*;

proptest! {
    /// Property: Arbitrary bytes don't crash the decoder
    #[test]
    fn arbitrary_bytes_dont_crash(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = Packet::decode(&random_bytes);
        // No panic = success
    }

    /// Property: Arbitrary bytes behind a valid magic don't crash either
    #[test]
    fn magic_prefixed_bytes_dont_crash(
        random_bytes in prop::collection::vec(any::<u8>(), 0..200),
    ) {
        let mut frame = WIRE_MAGIC.to_le_bytes().to_vec();
        frame.extend_from_slice(&random_bytes);
        let _result = Packet::decode(&frame);
    }

    /// Property: Heartbeats roundtrip for any clock value and sequence
    #[test]
    fn heartbeat_roundtrips(
        timestamp_ms in any::<u64>(),
        sequence in any::<u32>(),
    ) {
        let msg = WireMessage::Heartbeat { timestamp_ms };
        let encoded = msg.encode(sequence);
        let packet = Packet::decode(&encoded).unwrap();

        prop_assert_eq!(packet.sequence, sequence);
        prop_assert_eq!(packet.message, msg);
    }

    /// Property: Chat roundtrips for arbitrary (possibly empty) text
    #[test]
    fn chat_roundtrips(
        sender in ".{0,32}",
        text in ".{0,256}",
    ) {
        let msg = WireMessage::ChatMessage { sender, text };
        let encoded = msg.encode(0);
        let packet = Packet::decode(&encoded).unwrap();

        prop_assert_eq!(packet.message, msg);
    }

    /// Property: Position updates roundtrip bit-exactly
    #[test]
    fn position_roundtrips(
        x in any::<f32>(),
        y in any::<f32>(),
        z in any::<f32>(),
        heading in any::<f32>(),
    ) {
        prop_assume!(x.is_finite() && y.is_finite() && z.is_finite() && heading.is_finite());
        let msg = WireMessage::PositionUpdate { x, y, z, heading };
        let encoded = msg.encode(0);
        let packet = Packet::decode(&encoded).unwrap();

        prop_assert_eq!(packet.message, msg);
    }

    /// Property: Commands roundtrip for arbitrary argument lists
    #[test]
    fn command_roundtrips(
        name in "[a-z]{1,16}",
        args in prop::collection::vec(".{0,24}", 0..8),
    ) {
        let msg = WireMessage::Command { name, args };
        let encoded = msg.encode(0);
        let packet = Packet::decode(&encoded).unwrap();

        prop_assert_eq!(packet.message, msg);
    }

    /// Property: Truncation at every point yields None, never a panic
    #[test]
    fn truncated_frames_handled(
        truncate_at in 0usize..50,
    ) {
        let msg = WireMessage::Whisper {
            from: "ada".to_string(),
            to: "brin".to_string(),
            text: "psst".to_string(),
        };
        let encoded = msg.encode(3);

        if truncate_at < encoded.len() {
            prop_assert_eq!(Packet::decode(&encoded[..truncate_at]), None);
        }
    }

    /// Property: Oversized length fields are rejected before allocation
    #[test]
    fn oversized_length_handled(
        claimed_length in 200_000u32..u32::MAX,
    ) {
        let mut frame = WIRE_MAGIC.to_le_bytes().to_vec();
        frame.extend_from_slice(&2u16.to_le_bytes()); // version
        frame.push(0x30); // ChatMessage
        frame.extend_from_slice(&claimed_length.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes()); // sequence
        frame.extend_from_slice(&[0u8; 16]);
        prop_assert!(frame.len() > HEADER_LEN);

        prop_assert_eq!(Packet::decode(&frame), None);
    }
}
