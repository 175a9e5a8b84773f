//! Device/command identifiers and the closed [`EventKind`] classification.
//!
//! The numeric ids below are fixed by the robot firmware and must not change.

use serde::{Deserialize, Serialize};

/// Functional subsystems addressed by the first frame byte.
pub mod device {
    pub const GENERAL: u8 = 0;
    pub const MOTORS: u8 = 1;
    pub const LED: u8 = 3;
    pub const SOUND: u8 = 5;
    pub const IR_PROXIMITY: u8 = 11;
    pub const BUMPERS: u8 = 12;
    pub const BATTERY: u8 = 14;
    pub const ACCELEROMETER: u8 = 16;
    pub const TOUCH: u8 = 17;
    pub const DOCKING: u8 = 19;
    pub const CLIFF: u8 = 20;
    pub const CONNECTIVITY: u8 = 100;
}

pub mod general {
    pub const GET_VERSIONS: u8 = 0;
    pub const SET_NAME: u8 = 1;
    pub const GET_NAME: u8 = 2;
    pub const STOP_AND_RESET: u8 = 3;
    pub const STOP_PROJECT: u8 = 4;
    pub const DISCONNECT: u8 = 6;
    pub const ENABLE_EVENTS: u8 = 7;
    pub const DISABLE_EVENTS: u8 = 9;
    pub const GET_ENABLED_EVENTS: u8 = 11;
    pub const GET_SERIAL: u8 = 14;
    pub const GET_SKU: u8 = 15;
}

pub mod motors {
    pub const SET_SPEED: u8 = 4;
    pub const DRIVE_DISTANCE: u8 = 8;
    pub const ROTATE_ANGLE: u8 = 12;
    pub const RESET_POSITION: u8 = 15;
    pub const GET_POSITION: u8 = 16;
    pub const NAVIGATE_TO_POSITION: u8 = 17;
    pub const DOCK: u8 = 19;
    pub const UNDOCK: u8 = 20;
    pub const DRIVE_ARC: u8 = 27;
    pub const MOTOR_STALL: u8 = 29;
}

pub mod led {
    pub const SET_ANIMATION: u8 = 2;
}

pub mod sound {
    pub const PLAY_NOTE: u8 = 0;
    pub const STOP: u8 = 1;
    pub const SAY_PHRASE: u8 = 4;
    pub const PLAY_SWEEP: u8 = 5;
}

pub mod ir_proximity {
    pub const EVENT: u8 = 0;
    pub const GET_VALUES: u8 = 1;
    pub const GET_PACKED: u8 = 2;
    pub const SET_THRESHOLDS: u8 = 3;
    pub const GET_THRESHOLDS: u8 = 4;
}

pub mod battery {
    pub const EVENT: u8 = 0;
    pub const GET_LEVEL: u8 = 1;
}

pub mod accelerometer {
    pub const GET_ACCELERATION: u8 = 1;
}

pub mod docking {
    pub const EVENT: u8 = 0;
    pub const GET_VALUES: u8 = 1;
}

pub mod connectivity {
    pub const IPV4_CHANGE: u8 = 0;
    pub const GET_IPV4: u8 = 1;
    pub const REQUEST_UPDATE: u8 = 2;
    pub const UPDATE_PROGRESS: u8 = 3;
}

// ─────────────────────────────────────────────────────────────────────────────
// EventKind
// ─────────────────────────────────────────────────────────────────────────────

/// Named meaning of an inbound frame, derived from its `(device, command)`.
///
/// The set is closed: pairs without an entry classify as
/// [`EventKind::Unknown`], which is reported and ignored rather than treated
/// as a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventKind {
    // General
    Versions,
    NameSet,
    Name,
    StopProject,
    EnabledEvents,
    SerialNumber,
    Sku,
    // Motors
    DriveDistance,
    RotateAngle,
    Position,
    NavigateToPosition,
    Dock,
    Undock,
    DriveArc,
    MotorStall,
    // Sound
    NoteFinished,
    PhraseFinished,
    SweepFinished,
    // IR proximity
    IrProximityEvent,
    IrProximityValues,
    PackedIrProximity,
    EventThresholdsSet,
    EventThresholds,
    // Bumpers, touch, cliff
    Bumper,
    Touch,
    Cliff,
    // Battery
    BatteryEvent,
    BatteryLevel,
    // Accelerometer
    Acceleration,
    // Docking sensors
    DockingEvent,
    DockingValues,
    // Connectivity
    Ipv4Change,
    Ipv4Addresses,
    UpdateProgress,
    /// A pair with no table entry.
    Unknown { device: u8, command: u8 },
}

impl EventKind {
    /// Classify a `(device, command)` pair.
    pub fn classify(device_id: u8, command: u8) -> Self {
        use EventKind::*;
        match (device_id, command) {
            (device::GENERAL, general::GET_VERSIONS) => Versions,
            (device::GENERAL, general::SET_NAME) => NameSet,
            (device::GENERAL, general::GET_NAME) => Name,
            (device::GENERAL, general::STOP_PROJECT) => StopProject,
            (device::GENERAL, general::GET_ENABLED_EVENTS) => EnabledEvents,
            (device::GENERAL, general::GET_SERIAL) => SerialNumber,
            (device::GENERAL, general::GET_SKU) => Sku,

            (device::MOTORS, motors::DRIVE_DISTANCE) => DriveDistance,
            (device::MOTORS, motors::ROTATE_ANGLE) => RotateAngle,
            (device::MOTORS, motors::GET_POSITION) => Position,
            (device::MOTORS, motors::NAVIGATE_TO_POSITION) => NavigateToPosition,
            (device::MOTORS, motors::DOCK) => Dock,
            (device::MOTORS, motors::UNDOCK) => Undock,
            (device::MOTORS, motors::DRIVE_ARC) => DriveArc,
            (device::MOTORS, motors::MOTOR_STALL) => MotorStall,

            (device::SOUND, sound::PLAY_NOTE) => NoteFinished,
            (device::SOUND, sound::SAY_PHRASE) => PhraseFinished,
            (device::SOUND, sound::PLAY_SWEEP) => SweepFinished,

            (device::IR_PROXIMITY, ir_proximity::EVENT) => IrProximityEvent,
            (device::IR_PROXIMITY, ir_proximity::GET_VALUES) => IrProximityValues,
            (device::IR_PROXIMITY, ir_proximity::GET_PACKED) => PackedIrProximity,
            (device::IR_PROXIMITY, ir_proximity::SET_THRESHOLDS) => EventThresholdsSet,
            (device::IR_PROXIMITY, ir_proximity::GET_THRESHOLDS) => EventThresholds,

            (device::BUMPERS, 0) => Bumper,
            (device::TOUCH, 0) => Touch,
            (device::CLIFF, 0) => Cliff,

            (device::BATTERY, battery::EVENT) => BatteryEvent,
            (device::BATTERY, battery::GET_LEVEL) => BatteryLevel,

            (device::ACCELEROMETER, accelerometer::GET_ACCELERATION) => Acceleration,

            (device::DOCKING, docking::EVENT) => DockingEvent,
            (device::DOCKING, docking::GET_VALUES) => DockingValues,

            (device::CONNECTIVITY, connectivity::IPV4_CHANGE) => Ipv4Change,
            (device::CONNECTIVITY, connectivity::GET_IPV4) => Ipv4Addresses,
            (device::CONNECTIVITY, connectivity::UPDATE_PROGRESS) => UpdateProgress,

            (device, command) => Unknown { device, command },
        }
    }

    /// `true` for frames the robot emits on its own; their sequence byte is
    /// the device's event counter rather than a request id.
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self,
            EventKind::StopProject
                | EventKind::MotorStall
                | EventKind::IrProximityEvent
                | EventKind::Bumper
                | EventKind::Touch
                | EventKind::Cliff
                | EventKind::BatteryEvent
                | EventKind::DockingEvent
                | EventKind::Ipv4Change
                | EventKind::UpdateProgress
        )
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EventKind::Unknown { .. })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Unknown { device, command } => write!(f, "unknown({device}/{command})"),
            other => write!(f, "{other:?}"),
        }
    }
}
