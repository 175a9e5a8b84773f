//! `rove-perception` – turns raw frame payloads into robot state and steering.
//!
//! # Modules
//!
//! - [`ir`] – [`IrProximity`][ir::IrProximity]: the packed 7-sensor infra-red
//!   proximity sample, raw readings and [`EventThresholds`][ir::EventThresholds].
//! - [`sensors`] – decoders for pose, docking, battery, bumpers, touch, cliff,
//!   stall, accelerometer, connectivity and version responses.
//! - [`navigation`] – [`ClearanceLine`][navigation::ClearanceLine] for the
//!   dead-reckoned undock test and the obstacle-avoidance steering law.

pub mod ir;
pub mod navigation;
pub mod sensors;

pub use ir::{EventThresholds, IrProximity, IrReadings};
pub use navigation::{ClearanceLine, WheelSpeeds, avoidance_speeds};

// ────────────────────────────────────────────────────────────────────────────
// Big-endian payload readers
// ────────────────────────────────────────────────────────────────────────────

pub(crate) fn be_u16(p: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([p[at], p[at + 1]])
}

pub(crate) fn be_i16(p: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([p[at], p[at + 1]])
}

pub(crate) fn be_i32(p: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}
