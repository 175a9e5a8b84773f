//! `rove-types` – shared vocabulary of the rove robot link.
//!
//! # Modules
//!
//! - [`frame`] – the fixed 20-byte [`Frame`] and its CRC-8 trailer.
//! - [`protocol`] – device/command ids and the closed [`EventKind`] table.
//! - [`notice`] – [`LinkNotice`] diagnostics (corrupt frames, lost events, …).
//! - [`error`] – the [`RoveError`] taxonomy.

pub mod error;
pub mod frame;
pub mod notice;
pub mod protocol;

pub use error::{RoveError, check_range};
pub use frame::{FRAME_LEN, Frame, MAX_PAYLOAD, crc8};
pub use notice::{Diagnostic, LinkNotice};
pub use protocol::EventKind;

use serde::{Deserialize, Serialize};

/// Dead-reckoned robot pose as reported by the motor board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pose {
    /// Millimetres.
    pub x: i32,
    /// Millimetres.
    pub y: i32,
    /// Deci-degrees, `0..=3599`.
    pub heading: i16,
}

impl Pose {
    pub fn new(x: i32, y: i32, heading: i16) -> Self {
        Self { x, y, heading }
    }

    /// Heading converted to radians.
    pub fn heading_radians(&self) -> f64 {
        (f64::from(self.heading) / 10.0).to_radians()
    }
}
