//! Decoders for sensor events and query responses.
//!
//! Offsets below are payload offsets; payload byte `n` is wire byte `n + 3`.
//! Events and sensor responses start with a 4-byte timestamp.

use rove_types::{Frame, MAX_PAYLOAD, Pose};

use crate::{be_i16, be_i32, be_u16};

/// Pose carried by position queries and motion-completion responses.
pub fn pose(frame: &Frame) -> Pose {
    let p = frame.payload();
    Pose {
        x: be_i32(p, 4),
        y: be_i32(p, 8),
        heading: be_i16(p, 12),
    }
}

/// Encode a pose the way the motor board reports it.
pub fn pose_payload(timestamp_ms: u32, pose: &Pose) -> [u8; MAX_PAYLOAD] {
    let mut p = [0u8; MAX_PAYLOAD];
    p[..4].copy_from_slice(&timestamp_ms.to_be_bytes());
    p[4..8].copy_from_slice(&pose.x.to_be_bytes());
    p[8..12].copy_from_slice(&pose.y.to_be_bytes());
    p[12..14].copy_from_slice(&pose.heading.to_be_bytes());
    p
}

// ────────────────────────────────────────────────────────────────────────────
// Docking
// ────────────────────────────────────────────────────────────────────────────

/// Dock contact and dock-beacon IR readings (`19/0`, `19/1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockingSensors {
    pub contacts: bool,
    pub ir_left: u8,
    pub ir_right: u8,
}

impl DockingSensors {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        Self {
            contacts: p[4] == 1,
            ir_left: p[5],
            ir_right: p[6],
        }
    }

    /// The robot sits on the charger.
    pub fn is_docked(&self) -> bool {
        self.contacts
    }
}

/// Outcome status of a dock or undock manoeuvre.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockStatus {
    Succeeded,
    Aborted,
    Canceled,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockResult {
    pub status: DockStatus,
    pub docked: bool,
}

impl DockResult {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let status = match p[4] {
            0 => DockStatus::Succeeded,
            1 => DockStatus::Aborted,
            4 => DockStatus::Canceled,
            other => DockStatus::Other(other),
        };
        Self {
            status,
            docked: p[5] != 0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Contact sensors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bumpers {
    pub left: bool,
    pub right: bool,
}

impl Bumpers {
    pub fn from_frame(frame: &Frame) -> Self {
        let state = frame.payload()[4];
        Self {
            left: state & 0x80 != 0,
            right: state & 0x40 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchButtons {
    pub button_1: bool,
    pub button_2: bool,
}

impl TouchButtons {
    pub fn from_frame(frame: &Frame) -> Self {
        let state = frame.payload()[4];
        Self {
            button_1: state & 0x80 != 0,
            button_2: state & 0x40 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cliff {
    pub flags: u8,
    /// Millivolts.
    pub sensor: u16,
    /// Millivolts.
    pub threshold: u16,
}

impl Cliff {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        Self {
            flags: p[4],
            sensor: be_u16(p, 5),
            threshold: be_u16(p, 7),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallMotor {
    Left,
    Right,
    Marker,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCause {
    NoStall,
    Overcurrent,
    Undercurrent,
    Underspeed,
    SaturatedPid,
    Timeout,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorStall {
    pub motor: StallMotor,
    pub cause: StallCause,
}

impl MotorStall {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let motor = match p[4] {
            0 => StallMotor::Left,
            1 => StallMotor::Right,
            2 => StallMotor::Marker,
            other => StallMotor::Other(other),
        };
        let cause = match p[5] {
            0 => StallCause::NoStall,
            1 => StallCause::Overcurrent,
            2 => StallCause::Undercurrent,
            3 => StallCause::Underspeed,
            4 => StallCause::SaturatedPid,
            5 => StallCause::Timeout,
            other => StallCause::Other(other),
        };
        Self { motor, cause }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Power and motion sensing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Battery {
    pub millivolts: u16,
    pub percent: u8,
}

impl Battery {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        Self {
            millivolts: be_u16(p, 4),
            percent: p[6],
        }
    }
}

/// Acceleration in milli-g.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acceleration {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Acceleration {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        Self {
            x: be_i16(p, 4),
            y: be_i16(p, 6),
            z: be_i16(p, 8),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// General and connectivity
// ────────────────────────────────────────────────────────────────────────────

/// Board selector for the versions query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    Main,
    Color,
}

impl Board {
    pub fn id(self) -> u8 {
        match self {
            Board::Main => 0xA5,
            Board::Color => 0xC6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    pub firmware: String,
    pub hardware: String,
    pub bootloader: String,
    pub protocol: String,
}

impl Versions {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        Self {
            firmware: format!("{}.{}.{}", char::from(p[1]), p[2], p[9]),
            hardware: format!("{}.{}", p[3], p[4]),
            bootloader: format!("{}.{}", p[5], p[6]),
            protocol: format!("{}.{}", p[7], p[8]),
        }
    }
}

/// NUL-terminated UTF-8 text filling the payload (name, serial, SKU).
pub fn text(frame: &Frame) -> String {
    let p = frame.payload();
    let end = p.iter().position(|&b| b == 0).unwrap_or(p.len());
    String::from_utf8_lossy(&p[..end]).into_owned()
}

/// 128-bit device mask used to enable, disable and report events.
///
/// Device `d` maps to payload byte `15 - d / 8`, bit `d % 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(pub [u8; MAX_PAYLOAD]);

impl EventMask {
    /// One bit per device across the 16-byte payload.
    pub const MAX_DEVICES: u8 = 128;

    pub fn from_devices(devices: &[u8]) -> Self {
        let mut mask = Self::default();
        for &d in devices {
            mask.insert(d);
        }
        mask
    }

    /// Set the bit for `device`. Ids past [`EventMask::MAX_DEVICES`] have no
    /// bit and are ignored.
    pub fn insert(&mut self, device: u8) {
        if let Some(byte) = Self::byte_index(device).and_then(|i| self.0.get_mut(i)) {
            *byte |= 1 << (device % 8);
        }
    }

    pub fn contains(&self, device: u8) -> bool {
        Self::byte_index(device)
            .and_then(|i| self.0.get(i))
            .is_some_and(|byte| byte & (1 << (device % 8)) != 0)
    }

    /// Enabled device ids in ascending order.
    pub fn devices(&self) -> Vec<u8> {
        (0..Self::MAX_DEVICES).filter(|&d| self.contains(d)).collect()
    }

    /// Devices 0-7 live in the last byte, 120-127 in the first.
    fn byte_index(device: u8) -> Option<usize> {
        (MAX_PAYLOAD - 1).checked_sub(usize::from(device / 8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Addresses {
    pub wlan0: std::net::Ipv4Addr,
    pub wlan1: std::net::Ipv4Addr,
    pub usb0: std::net::Ipv4Addr,
}

impl Ipv4Addresses {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let addr = |at: usize| std::net::Ipv4Addr::new(p[at], p[at + 1], p[at + 2], p[at + 3]);
        Self {
            wlan0: addr(0),
            wlan1: addr(4),
            usb0: addr(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Downloading,
    Installing,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub stage: UpdateStage,
    pub percent: u8,
}

impl UpdateProgress {
    pub fn from_frame(frame: &Frame) -> Self {
        let p = frame.payload();
        let stage = match p[4] {
            b'd' => UpdateStage::Downloading,
            b'i' => UpdateStage::Installing,
            other => UpdateStage::Other(other),
        };
        Self {
            stage,
            percent: p[5],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(device: u8, command: u8, payload: &[u8]) -> Frame {
        let mut padded = [0u8; MAX_PAYLOAD];
        padded[..payload.len()].copy_from_slice(payload);
        Frame::from_parts(device, command, 0, padded)
    }

    #[test]
    fn pose_reads_signed_big_endian_fields() {
        let f = frame(1, 16, &[0, 0, 0, 9, 0xFF, 0xFF, 0xFF, 0x38, 0, 0, 1, 0x2C, 0x03, 0x84]);
        assert_eq!(pose(&f), Pose::new(-200, 300, 900));
        assert_eq!(f.timestamp_ms(), 9);
    }

    #[test]
    fn pose_payload_matches_decoder() {
        let p = Pose::new(-1, 123_456, 3599);
        assert_eq!(pose(&Frame::from_parts(1, 16, 0, pose_payload(5, &p))), p);
    }

    #[test]
    fn docking_contacts() {
        let docked = DockingSensors::from_frame(&frame(19, 1, &[0, 0, 0, 0, 1, 12, 34]));
        assert!(docked.is_docked());
        assert_eq!((docked.ir_left, docked.ir_right), (12, 34));
        assert!(!DockingSensors::from_frame(&frame(19, 1, &[0, 0, 0, 0, 0])).is_docked());
    }

    #[test]
    fn dock_result_status() {
        let r = DockResult::from_frame(&frame(1, 20, &[0, 0, 0, 0, 4, 0]));
        assert_eq!(r.status, DockStatus::Canceled);
        assert!(!r.docked);
    }

    #[test]
    fn bumper_bits() {
        let b = Bumpers::from_frame(&frame(12, 0, &[0, 0, 0, 0, 0xC0]));
        assert!(b.left && b.right);
        let b = Bumpers::from_frame(&frame(12, 0, &[0, 0, 0, 0, 0x40]));
        assert!(!b.left && b.right);
    }

    #[test]
    fn touch_uses_top_two_bits() {
        let t = TouchButtons::from_frame(&frame(17, 0, &[0, 0, 0, 0, 0x80]));
        assert!(t.button_1 && !t.button_2);
    }

    #[test]
    fn cliff_fields() {
        let c = Cliff::from_frame(&frame(20, 0, &[0, 0, 0, 0, 1, 0x01, 0xF4, 0x00, 0x64]));
        assert_eq!(c, Cliff { flags: 1, sensor: 500, threshold: 100 });
    }

    #[test]
    fn stall_motor_and_cause() {
        let s = MotorStall::from_frame(&frame(1, 29, &[0, 0, 0, 0, 1, 3]));
        assert_eq!(s.motor, StallMotor::Right);
        assert_eq!(s.cause, StallCause::Underspeed);
    }

    #[test]
    fn battery_and_acceleration() {
        let b = Battery::from_frame(&frame(14, 1, &[0, 0, 0, 0, 0x0E, 0x10, 87]));
        assert_eq!(b, Battery { millivolts: 3600, percent: 87 });
        let a = Acceleration::from_frame(&frame(16, 1, &[0, 0, 0, 0, 0xFF, 0xF6, 0, 5, 0x03, 0xE8]));
        assert_eq!(a, Acceleration { x: -10, y: 5, z: 1000 });
    }

    #[test]
    fn versions_string_fields() {
        let f = frame(0, 0, &[0xA5, b'J', 1, 2, 3, 4, 5, 1, 6, 7]);
        let v = Versions::from_frame(&f);
        assert_eq!(v.firmware, "J.1.7");
        assert_eq!(v.hardware, "2.3");
        assert_eq!(v.bootloader, "4.5");
        assert_eq!(v.protocol, "1.6");
    }

    #[test]
    fn text_stops_at_nul() {
        assert_eq!(text(&frame(0, 2, b"Rove\0junk")), "Rove");
        assert_eq!(text(&frame(0, 14, b"0123456789ABCDEF")), "0123456789ABCDEF");
    }

    #[test]
    fn event_mask_bit_positions() {
        let mask = EventMask::from_devices(&[0, 11, 12]);
        assert_eq!(mask.0[15], 0b0000_0001);
        assert_eq!(mask.0[14], 0b0001_1000);
        assert_eq!(mask.devices(), vec![0, 11, 12]);
        assert!(!mask.contains(19));
    }

    #[test]
    fn event_mask_edges() {
        let mut mask = EventMask::from_devices(&[127, 128, 255]);
        assert_eq!(mask.0[0], 0b1000_0000);
        assert_eq!(mask.devices(), vec![127]);
        assert!(!mask.contains(200));

        mask = EventMask([0xff; MAX_PAYLOAD]);
        assert_eq!(mask.devices().len(), 128);
    }

    #[test]
    fn ipv4_triplet() {
        let a = Ipv4Addresses::from_frame(&frame(100, 1, &[192, 168, 1, 7, 0, 0, 0, 0, 10, 0, 0, 1]));
        assert_eq!(a.wlan0.to_string(), "192.168.1.7");
        assert_eq!(a.usb0.to_string(), "10.0.0.1");
    }

    #[test]
    fn update_progress_stage() {
        let u = UpdateProgress::from_frame(&frame(100, 3, &[0, 0, 0, 0, b'i', 42]));
        assert_eq!(u.stage, UpdateStage::Installing);
        assert_eq!(u.percent, 42);
    }
}
