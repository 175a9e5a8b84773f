//! Infra-red proximity samples.
//!
//! # Packed layout
//!
//! The packed sample (event `11/0` and response `11/2`) squeezes seven
//! 12-bit intensities into the 16-byte payload:
//!
//! | Payload bytes | Content |
//! |---|---|
//! | 0..4 | timestamp (ms) |
//! | 4 | triggered flags, bit `i` = sensor `i` |
//! | 5..12 | high 8 bits of sensors 0..6 |
//! | 12..16 | low nibbles, two per byte: even sensor in the high nibble |
//!
//! Sensors are indexed left to right as seen from the robot.

use rove_types::{Frame, MAX_PAYLOAD};

use crate::be_u16;

/// Number of proximity sensors on the front bumper.
pub const IR_SENSORS: usize = 7;
/// Largest 12-bit intensity.
pub const MAX_INTENSITY: u16 = 0x0FFF;

const TRIGGERED_BYTE: usize = 4;
const HIGH_BYTES: usize = 5;
const NIBBLE_BYTES: usize = 12;

/// One decoded packed proximity sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrProximity {
    pub timestamp_ms: u32,
    pub triggered: [bool; IR_SENSORS],
    /// 12-bit intensities, `0..=4095`.
    pub values: [u16; IR_SENSORS],
}

impl IrProximity {
    /// Decode the packed layout of an IR event or packed-values response.
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let mut triggered = [false; IR_SENSORS];
        let mut values = [0u16; IR_SENSORS];
        for i in 0..IR_SENSORS {
            triggered[i] = p[TRIGGERED_BYTE] & (1 << i) != 0;
            let shift = 4 * (1 - i % 2);
            let nibble = (p[NIBBLE_BYTES + i / 2] >> shift) & 0x0F;
            values[i] = (u16::from(p[HIGH_BYTES + i]) << 4) | u16::from(nibble);
        }
        Self {
            timestamp_ms: frame.timestamp_ms(),
            triggered,
            values,
        }
    }

    /// Inverse of [`IrProximity::from_frame`]; intensities are masked to 12
    /// bits.
    pub fn to_payload(&self) -> [u8; MAX_PAYLOAD] {
        let mut p = [0u8; MAX_PAYLOAD];
        p[..4].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        for i in 0..IR_SENSORS {
            let value = self.values[i] & MAX_INTENSITY;
            if self.triggered[i] {
                p[TRIGGERED_BYTE] |= 1 << i;
            }
            p[HIGH_BYTES + i] = (value >> 4) as u8;
            let shift = 4 * (1 - i % 2);
            p[NIBBLE_BYTES + i / 2] |= ((value & 0x0F) as u8) << shift;
        }
        p
    }

    pub fn any_triggered(&self) -> bool {
        self.triggered.iter().any(|&t| t)
    }
}

/// Unpacked readings returned by the raw-values query (`11/1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrReadings {
    pub timestamp_ms: u32,
    pub values: [u16; 6],
}

impl IrReadings {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let mut values = [0u16; 6];
        for (i, v) in values.iter_mut().enumerate() {
            *v = be_u16(p, 4 + 2 * i);
        }
        Self {
            timestamp_ms: frame.timestamp_ms(),
            values,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event thresholds
// ────────────────────────────────────────────────────────────────────────────

/// Hysteresis plus per-sensor trigger thresholds for IR proximity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventThresholds {
    pub hysteresis: u16,
    pub thresholds: [u16; IR_SENSORS],
}

impl Default for EventThresholds {
    fn default() -> Self {
        Self {
            hysteresis: 20,
            thresholds: [150; IR_SENSORS],
        }
    }
}

impl EventThresholds {
    /// Payload of the set-thresholds command: hysteresis then seven
    /// thresholds, all big-endian `u16`.
    pub fn to_payload(&self) -> [u8; MAX_PAYLOAD] {
        let mut p = [0u8; MAX_PAYLOAD];
        p[..2].copy_from_slice(&self.hysteresis.to_be_bytes());
        for (i, t) in self.thresholds.iter().enumerate() {
            p[2 + 2 * i..4 + 2 * i].copy_from_slice(&t.to_be_bytes());
        }
        p
    }

    /// Decode a get-thresholds response; same layout as the command.
    pub fn from_frame(frame: &Frame) -> Self {
        Self::from_payload(frame.payload())
    }

    pub fn from_payload(p: &[u8; MAX_PAYLOAD]) -> Self {
        let mut thresholds = [0u16; IR_SENSORS];
        for (i, t) in thresholds.iter_mut().enumerate() {
            *t = be_u16(p, 2 + 2 * i);
        }
        Self {
            hysteresis: be_u16(p, 0),
            thresholds,
        }
    }
}
