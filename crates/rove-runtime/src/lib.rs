//! `rove-runtime` – autonomous behaviors on top of the robot link
//!
//! # Modules
//!
//! - [`behavior`] – [`BehaviorMachine`][behavior::BehaviorMachine]: the
//!   `SetEventThresholds → Undock → Roam ⇄ Obstacle → Halt` chain as an
//!   explicit state enum, one [`step`][behavior::BehaviorMachine::step] per
//!   transition, driven over the [`RobotLink`][behavior::RobotLink] seam.
//! - [`emergency`] – [`EmergencyStop`][emergency::EmergencyStop]: the
//!   cancellation token shared by one behavior run.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod behavior;
pub mod emergency;
pub mod telemetry;

pub use behavior::{BehaviorMachine, BehaviorParams, BehaviorReport, BehaviorState, RobotLink, StateName};
pub use emergency::EmergencyStop;
pub use telemetry::{LogFormat, TelemetrySettings, TracerProviderGuard, init_tracing};
