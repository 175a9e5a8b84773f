//! Navigation math for the autonomous behaviors.
//!
//! # Undock clearance
//!
//! Before reversing off the charger the robot fixes a reference line
//! `distance` millimetres behind its pose, perpendicular to its heading:
//!
//! ```text
//! p0 = (x - d·cos θ, y - d·sin θ)
//! p1 = p0 + d·(cos(θ + 90°), sin(θ + 90°))
//! side(q) = (p1.x - p0.x)(q.y - p0.y) - (q.x - p0.x)(p1.y - p0.y)
//! ```
//!
//! `side` is negative while the robot is still on the charger side of the
//! line and becomes non-negative once it has backed across it.
//!
//! # Obstacle steering
//!
//! [`avoidance_speeds`] maps the seven proximity intensities (left to right)
//! onto differential wheel speeds. Each sensor pulls the wheel on its own
//! side back harder than the opposite wheel, so a reading on the left pivots
//! the robot to the left (counter-clockwise) and a reading on the right
//! pivots it to the right:
//!
//! ```text
//! n_i   = value_i / 4095
//! left  = Σ (10 - 20·n_i·(7 - i))
//! right = Σ (10 - 20·n_i·(i + 1))
//! ```
//!
//! Both sums are floored and clamped to `±limit`.
//!
//! # Example
//!
//! ```rust
//! use rove_perception::navigation::ClearanceLine;
//! use rove_types::Pose;
//!
//! let line = ClearanceLine::behind(&Pose::new(0, 0, 0), 300.0);
//! assert!(!line.is_cleared(&Pose::new(-100, 0, 0)));
//! assert!(line.is_cleared(&Pose::new(-320, 0, 0)));
//! ```

use rove_types::Pose;
use tracing::trace;

use crate::ir::{IR_SENSORS, IrProximity, MAX_INTENSITY};

// ────────────────────────────────────────────────────────────────────────────
// Clearance line
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearanceLine {
    origin: (f64, f64),
    end: (f64, f64),
}

impl ClearanceLine {
    /// Line `distance_mm` behind `pose`, perpendicular to its heading.
    pub fn behind(pose: &Pose, distance_mm: f64) -> Self {
        let theta = pose.heading_radians();
        let origin = (
            f64::from(pose.x) - distance_mm * theta.cos(),
            f64::from(pose.y) - distance_mm * theta.sin(),
        );
        let normal = theta + std::f64::consts::FRAC_PI_2;
        let end = (
            origin.0 + distance_mm * normal.cos(),
            origin.1 + distance_mm * normal.sin(),
        );
        Self { origin, end }
    }

    /// Signed cross product of the line direction and the vector from the
    /// line origin to `pose`.
    pub fn side(&self, pose: &Pose) -> f64 {
        let (x0, y0) = self.origin;
        let (x1, y1) = self.end;
        (x1 - x0) * (f64::from(pose.y) - y0) - (f64::from(pose.x) - x0) * (y1 - y0)
    }

    /// `true` once `pose` has crossed to the far side of the line.
    pub fn is_cleared(&self, pose: &Pose) -> bool {
        self.side(pose) >= 0.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Obstacle steering
// ────────────────────────────────────────────────────────────────────────────

/// Per-sensor bias in mm/s before the intensity penalty is applied.
const CRUISE_SHARE: f64 = 10.0;
/// Penalty in mm/s for a saturated sensor at unit lever arm.
const STEERING_GAIN: f64 = 20.0;

/// Left/right wheel speeds in mm/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WheelSpeeds {
    pub left: i32,
    pub right: i32,
}

impl WheelSpeeds {
    pub fn new(left: i32, right: i32) -> Self {
        Self { left, right }
    }

    pub fn stopped() -> Self {
        Self::default()
    }
}

/// Steering for the current sample, or `None` when no sensor is triggered.
pub fn avoidance_speeds(sample: &IrProximity, limit: i32) -> Option<WheelSpeeds> {
    if !sample.any_triggered() {
        return None;
    }
    let mut left = 0.0;
    let mut right = 0.0;
    for i in 0..IR_SENSORS {
        let n = f64::from(sample.values[i].min(MAX_INTENSITY)) / f64::from(MAX_INTENSITY);
        left += CRUISE_SHARE - STEERING_GAIN * n * (IR_SENSORS - i) as f64;
        right += CRUISE_SHARE - STEERING_GAIN * n * (i + 1) as f64;
    }
    let clamp = |v: f64| (v.floor() as i32).clamp(-limit, limit);
    let speeds = WheelSpeeds::new(clamp(left), clamp(right));
    trace!(left = speeds.left, right = speeds.right, "avoidance speeds");
    Some(speeds)
}
