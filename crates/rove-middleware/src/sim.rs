//! In-process robot model for tests and offline sessions.
//!
//! [`SimRobot`] implements [`Transport`]: it decodes every written frame,
//! updates a small kinematic model and answers queries the way the firmware
//! does (same device/command/sequence id, big-endian payloads). It can also
//! misbehave on demand: reject writes as busy, fail the link, corrupt the
//! first threshold writes, skip event ids or go silent.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rove_middleware::{Connection, LinkConfig, RobotClient, sim::SimRobot};
//!
//! # async fn demo() -> Result<(), rove_types::RoveError> {
//! let sim = Arc::new(SimRobot::new().docked(true));
//! let conn = Connection::open(sim.clone(), LinkConfig::default()).await;
//! let robot = RobotClient::new(Arc::new(conn));
//! assert!(robot.docking_sensors().await?.is_docked());
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rove_perception::ir::{EventThresholds, IR_SENSORS, IrProximity};
use rove_perception::sensors::{EventMask, pose_payload};
use rove_types::protocol::{
    accelerometer, battery, connectivity, device, docking, general, ir_proximity, motors, sound,
};
use rove_types::{FRAME_LEN, Frame, MAX_PAYLOAD, Pose, RoveError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::Transport;

/// Simulated time that passes between two position queries.
const DEFAULT_STEP_MS: u32 = 100;
/// Distance between the wheels.
const WHEEL_BASE_MM: f64 = 235.0;
/// Reversing further than this off the dock breaks the charging contacts.
const DOCK_CONTACT_MM: f64 = 50.0;

// ────────────────────────────────────────────────────────────────────────────
// Model state
// ────────────────────────────────────────────────────────────────────────────

struct SimState {
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
    clock_ms: u32,
    step_ms: u32,
    x: f64,
    y: f64,
    heading_deg: f64,
    speeds: (i32, i32),
    docked: bool,
    dock_position: (f64, f64),
    thresholds: EventThresholds,
    noisy_threshold_writes: u32,
    obstacle: [u16; IR_SENSORS],
    obstacle_polls: u32,
    event_id: u8,
    enabled_events: EventMask,
    name: String,
    busy_writes: u32,
    failed: bool,
    muted: bool,
    accepted: Vec<Frame>,
    rejected: Vec<Frame>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            notify: None,
            clock_ms: 0,
            step_ms: DEFAULT_STEP_MS,
            x: 0.0,
            y: 0.0,
            heading_deg: 0.0,
            speeds: (0, 0),
            docked: false,
            dock_position: (0.0, 0.0),
            thresholds: EventThresholds::default(),
            noisy_threshold_writes: 0,
            obstacle: [0; IR_SENSORS],
            obstacle_polls: 0,
            event_id: 0,
            enabled_events: EventMask::default(),
            name: "rove-sim".to_string(),
            busy_writes: 0,
            failed: false,
            muted: false,
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl SimState {
    fn pose(&self) -> Pose {
        let heading = (self.heading_deg.rem_euclid(360.0) * 10.0).round() as i16 % 3600;
        Pose::new(self.x.round() as i32, self.y.round() as i32, heading)
    }

    /// Integrate the commanded wheel speeds over one simulation step.
    fn advance(&mut self) {
        let dt = f64::from(self.step_ms) / 1000.0;
        let (left, right) = (f64::from(self.speeds.0), f64::from(self.speeds.1));
        let v = (left + right) / 2.0;
        let omega = (right - left) / WHEEL_BASE_MM;
        let theta = self.heading_deg.to_radians();
        self.x += v * theta.cos() * dt;
        self.y += v * theta.sin() * dt;
        self.heading_deg = (self.heading_deg + omega.to_degrees() * dt).rem_euclid(360.0);
        self.clock_ms = self.clock_ms.wrapping_add(self.step_ms);

        if self.docked {
            let (dx, dy) = (self.x - self.dock_position.0, self.y - self.dock_position.1);
            if dx.hypot(dy) > DOCK_CONTACT_MM {
                debug!("sim: left the dock");
                self.docked = false;
            }
        }
    }

    fn ir_sample(&self) -> IrProximity {
        let values = if self.obstacle_polls > 0 { self.obstacle } else { [0; IR_SENSORS] };
        let mut triggered = [false; IR_SENSORS];
        for i in 0..IR_SENSORS {
            triggered[i] = values[i] > self.thresholds.thresholds[i];
        }
        IrProximity {
            timestamp_ms: self.clock_ms,
            triggered,
            values,
        }
    }

    fn stamped(&self, fields: &[u8]) -> [u8; MAX_PAYLOAD] {
        let mut p = [0u8; MAX_PAYLOAD];
        p[..4].copy_from_slice(&self.clock_ms.to_be_bytes());
        let n = fields.len().min(MAX_PAYLOAD - 4);
        p[4..4 + n].copy_from_slice(&fields[..n]);
        p
    }

    fn send(&self, frame: Frame) {
        if self.muted {
            return;
        }
        if let Some(tx) = &self.notify {
            let _ = tx.send(frame.encode().to_vec());
        }
    }

    fn respond(&self, request: &Frame, payload: [u8; MAX_PAYLOAD]) {
        self.send(Frame::from_parts(request.device, request.command, request.sequence_id, payload));
    }

    fn emit(&mut self, device_id: u8, command: u8, payload: [u8; MAX_PAYLOAD]) {
        let id = self.event_id;
        self.event_id = self.event_id.wrapping_add(1);
        self.send(Frame::from_parts(device_id, command, id, payload));
    }

    fn respond_pose(&self, request: &Frame) {
        self.respond(request, pose_payload(self.clock_ms, &self.pose()));
    }

    fn handle(&mut self, frame: &Frame) {
        let p = *frame.payload();
        let i32_at = |at: usize| i32::from_be_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]]);
        match (frame.device, frame.command) {
            (device::MOTORS, motors::SET_SPEED) => {
                self.speeds = (i32_at(0), i32_at(4));
                if self.speeds.0 > 0 && self.speeds.1 > 0 && self.obstacle_polls > 0 {
                    let sample = self.ir_sample();
                    self.emit(device::IR_PROXIMITY, ir_proximity::EVENT, sample.to_payload());
                }
            }
            (device::MOTORS, motors::GET_POSITION) => {
                self.advance();
                self.respond_pose(frame);
            }
            (device::MOTORS, motors::DRIVE_DISTANCE) => {
                let d = f64::from(i32_at(0));
                let theta = self.heading_deg.to_radians();
                self.x += d * theta.cos();
                self.y += d * theta.sin();
                self.respond_pose(frame);
            }
            (device::MOTORS, motors::ROTATE_ANGLE) | (device::MOTORS, motors::DRIVE_ARC) => {
                let angle = f64::from(i32_at(0)) / 10.0;
                self.heading_deg = (self.heading_deg + angle).rem_euclid(360.0);
                self.respond_pose(frame);
            }
            (device::MOTORS, motors::RESET_POSITION) => {
                self.x = 0.0;
                self.y = 0.0;
                self.heading_deg = 0.0;
            }
            (device::MOTORS, motors::NAVIGATE_TO_POSITION) => {
                self.x = f64::from(i32_at(0));
                self.y = f64::from(i32_at(4));
                let heading = i16::from_be_bytes([p[8], p[9]]);
                if heading >= 0 {
                    self.heading_deg = f64::from(heading) / 10.0;
                }
                self.respond_pose(frame);
            }
            (device::MOTORS, motors::DOCK) => {
                self.docked = true;
                self.dock_position = (self.x, self.y);
                self.respond(frame, self.stamped(&[0, 1]));
            }
            (device::MOTORS, motors::UNDOCK) => {
                self.docked = false;
                self.respond(frame, self.stamped(&[0, 0]));
            }
            (device::DOCKING, docking::GET_VALUES) => {
                self.respond(frame, self.stamped(&[u8::from(self.docked), 0, 0]));
            }
            (device::IR_PROXIMITY, ir_proximity::SET_THRESHOLDS) => {
                let mut written = EventThresholds::from_payload(&p);
                if self.noisy_threshold_writes > 0 {
                    self.noisy_threshold_writes -= 1;
                    written.hysteresis = written.hysteresis.wrapping_add(1);
                }
                self.thresholds = written;
            }
            (device::IR_PROXIMITY, ir_proximity::GET_THRESHOLDS) => {
                self.respond(frame, self.thresholds.to_payload());
            }
            (device::IR_PROXIMITY, ir_proximity::GET_PACKED) => {
                let sample = self.ir_sample();
                self.obstacle_polls = self.obstacle_polls.saturating_sub(1);
                self.respond(frame, sample.to_payload());
            }
            (device::IR_PROXIMITY, ir_proximity::GET_VALUES) => {
                let sample = self.ir_sample();
                let mut fields = Vec::with_capacity(12);
                for v in &sample.values[..6] {
                    fields.extend_from_slice(&v.to_be_bytes());
                }
                self.respond(frame, self.stamped(&fields));
            }
            (device::BATTERY, battery::GET_LEVEL) => {
                self.respond(frame, self.stamped(&[0x0E, 0x74, 93]));
            }
            (device::ACCELEROMETER, accelerometer::GET_ACCELERATION) => {
                self.respond(frame, self.stamped(&[0, 0, 0, 0, 0x03, 0xE8]));
            }
            (device::GENERAL, general::GET_VERSIONS) => {
                self.respond(frame, padded(&[p[0], b'S', 1, 1, 0, 3, 1, 1, 6, 4]));
            }
            (device::GENERAL, general::SET_NAME) => {
                let end = p.iter().position(|&b| b == 0).unwrap_or(MAX_PAYLOAD);
                self.name = String::from_utf8_lossy(&p[..end]).into_owned();
            }
            (device::GENERAL, general::GET_NAME) => self.respond(frame, padded(self.name.as_bytes())),
            (device::GENERAL, general::GET_SERIAL) => self.respond(frame, padded(b"SIM0000000000001")),
            (device::GENERAL, general::GET_SKU) => self.respond(frame, padded(b"RT0-SIM")),
            (device::GENERAL, general::ENABLE_EVENTS) => {
                for (have, add) in self.enabled_events.0.iter_mut().zip(p) {
                    *have |= add;
                }
            }
            (device::GENERAL, general::DISABLE_EVENTS) => {
                for (have, remove) in self.enabled_events.0.iter_mut().zip(p) {
                    *have &= !remove;
                }
            }
            (device::GENERAL, general::GET_ENABLED_EVENTS) => self.respond(frame, self.enabled_events.0),
            (device::GENERAL, general::STOP_AND_RESET) => self.speeds = (0, 0),
            (device::GENERAL, general::DISCONNECT) => self.notify = None,
            (device::SOUND, sound::PLAY_NOTE) | (device::SOUND, sound::SAY_PHRASE) => {
                self.respond(frame, self.stamped(&[]));
            }
            (device::CONNECTIVITY, connectivity::GET_IPV4) => {
                self.respond(frame, padded(&[127, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]));
            }
            (device::CONNECTIVITY, connectivity::REQUEST_UPDATE) => {
                let progress = self.stamped(&[b'd', 100]);
                self.emit(device::CONNECTIVITY, connectivity::UPDATE_PROGRESS, progress);
            }
            (d, c) => debug!(device = d, command = c, "sim: no model for command"),
        }
    }
}

fn padded(bytes: &[u8]) -> [u8; MAX_PAYLOAD] {
    let mut p = [0u8; MAX_PAYLOAD];
    let n = bytes.len().min(MAX_PAYLOAD);
    p[..n].copy_from_slice(&bytes[..n]);
    p
}

// ────────────────────────────────────────────────────────────────────────────
// SimRobot
// ────────────────────────────────────────────────────────────────────────────

/// A simulated robot reachable through the [`Transport`] trait.
///
/// Configure it with the consuming `with_*`/`docked` builders, share it as
/// `Arc<SimRobot>`, and use the `&self` methods to inject faults or inspect
/// what was written while a connection is running.
pub struct SimRobot {
    state: Arc<Mutex<SimState>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl SimRobot {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SimState {
            notify: Some(tx),
            ..SimState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            notifications: Mutex::new(Some(rx)),
        }
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    /// Start on (or off) the charger at the current pose.
    pub fn docked(self, docked: bool) -> Self {
        {
            let mut s = self.lock();
            s.docked = docked;
            s.dock_position = (s.x, s.y);
        }
        self
    }

    pub fn with_pose(self, pose: Pose) -> Self {
        {
            let mut s = self.lock();
            s.x = f64::from(pose.x);
            s.y = f64::from(pose.y);
            s.heading_deg = f64::from(pose.heading) / 10.0;
            s.dock_position = (s.x, s.y);
        }
        self
    }

    /// Report `values` for the next `polls` packed-IR queries, then a clear
    /// field of view. While the obstacle is present, commanding forward
    /// motion raises an IR proximity event.
    pub fn with_obstacle(self, values: [u16; IR_SENSORS], polls: u32) -> Self {
        self.set_obstacle(values, polls);
        self
    }

    /// The first `count` threshold writes are stored with a wrong hysteresis.
    pub fn with_noisy_threshold_writes(self, count: u32) -> Self {
        self.lock().noisy_threshold_writes = count;
        self
    }

    /// Simulated milliseconds per position query.
    pub fn with_step_ms(self, step_ms: u32) -> Self {
        self.lock().step_ms = step_ms;
        self
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    pub fn set_obstacle(&self, values: [u16; IR_SENSORS], polls: u32) {
        let mut s = self.lock();
        s.obstacle = values;
        s.obstacle_polls = polls;
    }

    /// Reject the next `count` writes with [`RoveError::TransportBusy`].
    pub fn reject_next_writes(&self, count: u32) {
        self.lock().busy_writes = count;
    }

    /// Fail every further write with [`RoveError::TransportFatal`].
    pub fn fail_link(&self) {
        self.lock().failed = true;
    }

    /// Stop answering; writes are still accepted.
    pub fn mute(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// End the notification stream.
    pub fn disconnect(&self) {
        self.lock().notify = None;
    }

    /// Advance the device event counter without sending, so the next event
    /// reveals a gap of `count`.
    pub fn drop_events(&self, count: u8) {
        let mut s = self.lock();
        s.event_id = s.event_id.wrapping_add(count);
    }

    /// Emit an unsolicited event with the next event id.
    pub fn emit_event(&self, device_id: u8, command: u8, fields: &[u8]) {
        let mut s = self.lock();
        let payload = s.stamped(fields);
        s.emit(device_id, command, payload);
    }

    /// Push raw bytes onto the notification stream.
    pub fn inject(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.lock().notify {
            let _ = tx.send(bytes);
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Frames accepted by the link, in write order.
    pub fn writes(&self) -> Vec<Frame> {
        self.lock().accepted.clone()
    }

    /// Frames rejected as busy, in write order.
    pub fn rejected(&self) -> Vec<Frame> {
        self.lock().rejected.clone()
    }

    /// Every accepted wheel-speed command as `(left, right)`.
    pub fn speed_commands(&self) -> Vec<(i32, i32)> {
        self.lock()
            .accepted
            .iter()
            .filter(|f| f.device == device::MOTORS && f.command == motors::SET_SPEED)
            .map(|f| {
                let p = f.payload();
                (
                    i32::from_be_bytes([p[0], p[1], p[2], p[3]]),
                    i32::from_be_bytes([p[4], p[5], p[6], p[7]]),
                )
            })
            .collect()
    }

    pub fn pose(&self) -> Pose {
        self.lock().pose()
    }

    pub fn is_docked(&self) -> bool {
        self.lock().docked
    }

    pub fn thresholds(&self) -> EventThresholds {
        self.lock().thresholds
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimRobot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimRobot {
    async fn write(&self, wire: [u8; FRAME_LEN]) -> Result<(), RoveError> {
        let frame = Frame::decode(&wire)?;
        let mut s = self.lock();
        if s.failed {
            return Err(RoveError::TransportFatal("simulated link failure".to_string()));
        }
        if s.busy_writes > 0 {
            s.busy_writes -= 1;
            s.rejected.push(frame);
            return Err(RoveError::TransportBusy);
        }
        s.accepted.push(frame);
        s.handle(&frame);
        Ok(())
    }

    async fn notifications(&self) -> BoxStream<'static, Vec<u8>> {
        let rx = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|bytes| (bytes, rx)) }).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_frame(stream: &mut BoxStream<'static, Vec<u8>>) -> Result<Frame, Box<dyn std::error::Error>> {
        let bytes = stream.next().await.ok_or("stream ended")?;
        Ok(Frame::decode(&bytes)?)
    }

    #[tokio::test]
    async fn position_query_echoes_sequence_id_and_integrates_speed() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRobot::new();
        let mut stream = sim.notifications().await;

        sim.write(Frame::new(1, 4, 0, &[0xFF, 0xFF, 0xFF, 0xB0, 0xFF, 0xFF, 0xFF, 0xB0])?.encode()).await?;
        sim.write(Frame::new(1, 16, 42, &[])?.encode()).await?;

        let reply = next_frame(&mut stream).await?;
        assert_eq!((reply.device, reply.command, reply.sequence_id), (1, 16, 42));
        assert_eq!(rove_perception::sensors::pose(&reply), Pose::new(-8, 0, 0));
        assert_eq!(sim.speed_commands(), vec![(-80, -80)]);
        Ok(())
    }

    #[tokio::test]
    async fn busy_writes_are_rejected_and_not_applied() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRobot::new();
        sim.reject_next_writes(1);
        let wire = Frame::new(1, 4, 0, &[0, 0, 0, 10, 0, 0, 0, 10])?.encode();

        assert_eq!(sim.write(wire).await, Err(RoveError::TransportBusy));
        assert!(sim.speed_commands().is_empty());
        sim.write(wire).await?;
        assert_eq!(sim.speed_commands(), vec![(10, 10)]);
        assert_eq!(sim.rejected().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn noisy_threshold_write_reads_back_different() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRobot::new().with_noisy_threshold_writes(1);
        let wanted = EventThresholds::default();
        sim.write(Frame::new(11, 3, 0, &wanted.to_payload())?.encode()).await?;
        assert_ne!(sim.thresholds(), wanted);
        sim.write(Frame::new(11, 3, 1, &wanted.to_payload())?.encode()).await?;
        assert_eq!(sim.thresholds(), wanted);
        Ok(())
    }

    #[tokio::test]
    async fn forward_motion_into_obstacle_raises_event() -> Result<(), Box<dyn std::error::Error>> {
        let sim = SimRobot::new().with_obstacle([4000, 0, 0, 0, 0, 0, 0], 2);
        let mut stream = sim.notifications().await;
        sim.drop_events(3);
        sim.write(Frame::new(1, 4, 0, &[0, 0, 0, 80, 0, 0, 0, 80])?.encode()).await?;

        let event = next_frame(&mut stream).await?;
        assert_eq!((event.device, event.command, event.sequence_id), (11, 0, 3));
        assert!(IrProximity::from_frame(&event).triggered[0]);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_ends_the_stream() {
        let sim = SimRobot::new();
        let mut stream = sim.notifications().await;
        sim.disconnect();
        assert!(stream.next().await.is_none());
    }
}
