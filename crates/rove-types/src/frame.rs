//! Fixed-size wire frame and its CRC-8 trailer.
//!
//! Every command and every notification exchanged with the robot is exactly
//! [`FRAME_LEN`] bytes:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 1 | device |
//! | 1 | 1 | command |
//! | 2 | 1 | sequence id (event id for unsolicited events) |
//! | 3 | 16 | payload, zero-padded |
//! | 19 | 1 | CRC-8 over bytes `0..19` |
//!
//! # Example
//!
//! ```rust
//! use rove_types::frame::{Frame, crc8};
//!
//! let frame = Frame::new(1, 4, 7, &[0, 0, 0, 80, 0, 0, 0, 80]).unwrap();
//! let wire = frame.encode();
//! assert_eq!(wire[19], 0x4F);
//! assert_eq!(crc8(&wire), 0);
//! assert_eq!(Frame::decode(&wire).unwrap(), frame);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RoveError;

/// Total encoded size of a frame on the wire.
pub const FRAME_LEN: usize = 20;
/// Bytes preceding the payload (device, command, sequence id).
pub const HEADER_LEN: usize = 3;
/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD: usize = 16;

/// CRC-8 (polynomial `0x07`, initial value `0`, MSB first).
///
/// Running the CRC over a complete, valid frame (trailer included) yields `0`.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &c in bytes {
        for i in 0..8 {
            let mut b = crc & 0x80;
            if c & (0x80 >> i) != 0 {
                b ^= 0x80;
            }
            crc <<= 1;
            if b != 0 {
                crc ^= 0x07;
            }
        }
    }
    crc
}

/// A decoded (or about to be encoded) protocol frame.
///
/// Frames are immutable value objects. The CRC is not stored: it is derived
/// from the other fields by [`Frame::encode`] and verified by
/// [`Frame::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub device: u8,
    pub command: u8,
    pub sequence_id: u8,
    payload: [u8; MAX_PAYLOAD],
}

impl Frame {
    /// Build a frame, zero-padding `payload` to [`MAX_PAYLOAD`] bytes.
    ///
    /// Returns [`RoveError::PayloadTooLarge`] when `payload` does not fit.
    pub fn new(device: u8, command: u8, sequence_id: u8, payload: &[u8]) -> Result<Self, RoveError> {
        Ok(Self {
            device,
            command,
            sequence_id,
            payload: pad_payload(payload)?,
        })
    }

    /// Build a frame from an already padded payload. Infallible.
    pub fn from_parts(device: u8, command: u8, sequence_id: u8, payload: [u8; MAX_PAYLOAD]) -> Self {
        Self {
            device,
            command,
            sequence_id,
            payload,
        }
    }

    /// The zero-padded payload.
    pub fn payload(&self) -> &[u8; MAX_PAYLOAD] {
        &self.payload
    }

    /// Serialise into the 20-byte wire representation, CRC included.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut wire = [0u8; FRAME_LEN];
        wire[0] = self.device;
        wire[1] = self.command;
        wire[2] = self.sequence_id;
        wire[HEADER_LEN..HEADER_LEN + MAX_PAYLOAD].copy_from_slice(&self.payload);
        wire[FRAME_LEN - 1] = crc8(&wire[..FRAME_LEN - 1]);
        wire
    }

    /// Parse a wire frame, verifying its length and CRC trailer.
    ///
    /// * [`RoveError::WrongFrameLength`] – `bytes` is not exactly 20 bytes.
    /// * [`RoveError::CorruptFrame`] – the trailer does not match the CRC of
    ///   the first 19 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, RoveError> {
        if bytes.len() != FRAME_LEN {
            return Err(RoveError::WrongFrameLength(bytes.len()));
        }
        let expected = crc8(&bytes[..FRAME_LEN - 1]);
        let actual = bytes[FRAME_LEN - 1];
        if expected != actual {
            return Err(RoveError::CorruptFrame { expected, actual });
        }
        let mut payload = [0u8; MAX_PAYLOAD];
        payload.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + MAX_PAYLOAD]);
        Ok(Self {
            device: bytes[0],
            command: bytes[1],
            sequence_id: bytes[2],
            payload,
        })
    }

    /// Device timestamp in milliseconds carried in the first four payload
    /// bytes of events and most responses.
    pub fn timestamp_ms(&self) -> u32 {
        u32::from_be_bytes([self.payload[0], self.payload[1], self.payload[2], self.payload[3]])
    }
}

/// Zero-pad `payload` to a full frame payload.
pub fn pad_payload(payload: &[u8]) -> Result<[u8; MAX_PAYLOAD], RoveError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RoveError::PayloadTooLarge(payload.len()));
    }
    let mut padded = [0u8; MAX_PAYLOAD];
    padded[..payload.len()].copy_from_slice(payload);
    Ok(padded)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc_matches_reference_vectors() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(&[0u8; 19]), 0x00);
    }

    #[test]
    fn crc_oracle_for_id_one_frame() -> Result<(), Box<dyn std::error::Error>> {
        let mut header = [0u8; 19];
        header[2] = 1;
        assert_eq!(crc8(&header), 0x0E);

        let wire = Frame::new(0, 0, 1, &[])?.encode();
        assert_eq!(wire[19], 0x0E);
        Ok(())
    }

    #[test]
    fn encoded_frame_is_always_twenty_bytes_and_self_checks() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::new(11, 3, 255, &[0, 20, 0, 150, 0, 150])?;
        let wire = frame.encode();
        assert_eq!(wire.len(), FRAME_LEN);
        assert_eq!(wire[19], crc8(&wire[..19]));
        assert_eq!(crc8(&wire), 0);
        assert_eq!(Frame::decode(&wire)?, frame);
        Ok(())
    }

    #[test]
    fn set_speed_frame_matches_captured_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::new(1, 4, 7, &[0, 0, 0, 80, 0, 0, 0, 80])?;
        let wire = frame.encode();
        assert_eq!(
            wire,
            [1, 4, 7, 0, 0, 0, 80, 0, 0, 0, 80, 0, 0, 0, 0, 0, 0, 0, 0, 0x4F]
        );
        Ok(())
    }

    #[test]
    fn payload_larger_than_sixteen_bytes_is_rejected() {
        let err = Frame::new(0, 1, 0, &[b'x'; 17]).unwrap_err();
        assert_eq!(err, RoveError::PayloadTooLarge(17));
    }

    #[test]
    fn sixteen_byte_payload_is_accepted_without_truncation() -> Result<(), Box<dyn std::error::Error>> {
        let payload: Vec<u8> = (1..=16).collect();
        let frame = Frame::new(0, 1, 0, &payload)?;
        assert_eq!(&frame.payload()[..], &payload[..]);
        Ok(())
    }

    #[test]
    fn flipped_bit_is_reported_as_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let mut wire = Frame::new(1, 16, 9, &[1, 2, 3])?.encode();
        wire[5] ^= 0x10;
        let err = Frame::decode(&wire).unwrap_err();
        assert!(matches!(err, RoveError::CorruptFrame { .. }));
        Ok(())
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = Frame::decode(&[0u8; 19]).unwrap_err();
        assert_eq!(err, RoveError::WrongFrameLength(19));
    }

    proptest! {
        /// Any frame survives the wire unchanged.
        #[test]
        fn decode_inverts_encode(
            device in any::<u8>(),
            command in any::<u8>(),
            seq in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
        ) {
            let frame = Frame::new(device, command, seq, &payload)?;
            let wire = frame.encode();
            prop_assert_eq!(crc8(&wire), 0);
            prop_assert_eq!(Frame::decode(&wire)?, frame);
            prop_assert_eq!(&frame.payload()[..payload.len()], &payload[..]);
        }

        /// Changing any single byte, the trailer included, fails the check.
        #[test]
        fn single_byte_corruption_is_rejected(
            payload in any::<[u8; MAX_PAYLOAD]>(),
            header in any::<[u8; HEADER_LEN]>(),
            at in 0..FRAME_LEN,
            flip in 1..=u8::MAX,
        ) {
            let mut wire = Frame::from_parts(header[0], header[1], header[2], payload).encode();
            wire[at] ^= flip;
            let rejected = matches!(Frame::decode(&wire), Err(RoveError::CorruptFrame { .. }));
            prop_assert!(rejected);
        }
    }

    #[test]
    fn timestamp_reads_first_four_payload_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::new(12, 0, 3, &[0x00, 0x01, 0x02, 0x03, 0x80])?;
        assert_eq!(frame.timestamp_ms(), 0x0001_0203);
        Ok(())
    }
}
