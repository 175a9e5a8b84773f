//! Typed robot commands on top of a [`Connection`].
//!
//! Every method builds the fixed payload for one `(device, command)` pair,
//! validates its arguments against the firmware's ranges, and decodes the
//! response into a `rove-perception` type. Commands without a response
//! resolve once the transport accepts the frame.

use std::sync::Arc;

use rove_perception::ir::{EventThresholds, IrProximity, IrReadings};
use rove_perception::sensors::{
    self, Acceleration, Battery, Board, DockResult, DockingSensors, EventMask, Ipv4Addresses, Versions,
};
use rove_types::protocol::{
    accelerometer, battery, connectivity, device, docking, general, ir_proximity, led, motors, sound,
};
use rove_types::{EventKind, MAX_PAYLOAD, Pose, RoveError, check_range};

use crate::connection::Connection;
use crate::router::Subscription;

/// Wheel speed bound in mm/s.
pub const MAX_WHEEL_SPEED: i32 = 100;

/// LED ring animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedAnimation {
    Off,
    On,
    Blink,
    Spin,
}

impl LedAnimation {
    fn id(self) -> u8 {
        match self {
            LedAnimation::Off => 0,
            LedAnimation::On => 1,
            LedAnimation::Blink => 2,
            LedAnimation::Spin => 3,
        }
    }
}

/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct RobotClient {
    conn: Arc<Connection>,
}

impl RobotClient {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Persistent stream of one event kind.
    pub fn subscribe(&self, kind: EventKind) -> Result<Subscription, RoveError> {
        self.conn.subscribe(kind)
    }

    // -----------------------------------------------------------------------
    // General
    // -----------------------------------------------------------------------

    pub async fn versions(&self, board: Board) -> Result<Versions, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Versions, device::GENERAL, general::GET_VERSIONS, &[board.id()])
            .await?;
        Ok(Versions::from_frame(&frame))
    }

    /// Set the advertised name; at most 16 bytes of UTF-8.
    pub async fn set_name(&self, name: &str) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::GENERAL, general::SET_NAME, name.as_bytes())
            .await?;
        Ok(())
    }

    pub async fn name(&self) -> Result<String, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Name, device::GENERAL, general::GET_NAME, &[])
            .await?;
        Ok(sensors::text(&frame))
    }

    /// Stop all motion and sound and reset the running project.
    pub async fn stop_and_reset(&self) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::GENERAL, general::STOP_AND_RESET, &[])
            .await?;
        Ok(())
    }

    /// Ask the robot to drop the link.
    pub async fn disconnect(&self) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::GENERAL, general::DISCONNECT, &[])
            .await?;
        Ok(())
    }

    pub async fn enable_events(&self, devices: &[u8]) -> Result<(), RoveError> {
        let mask = EventMask::from_devices(devices);
        self.conn
            .send_without_response(device::GENERAL, general::ENABLE_EVENTS, &mask.0)
            .await?;
        Ok(())
    }

    pub async fn disable_events(&self, devices: &[u8]) -> Result<(), RoveError> {
        let mask = EventMask::from_devices(devices);
        self.conn
            .send_without_response(device::GENERAL, general::DISABLE_EVENTS, &mask.0)
            .await?;
        Ok(())
    }

    pub async fn enabled_events(&self) -> Result<EventMask, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::EnabledEvents, device::GENERAL, general::GET_ENABLED_EVENTS, &[])
            .await?;
        Ok(EventMask(*frame.payload()))
    }

    pub async fn serial_number(&self) -> Result<String, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::SerialNumber, device::GENERAL, general::GET_SERIAL, &[])
            .await?;
        Ok(sensors::text(&frame))
    }

    pub async fn sku(&self) -> Result<String, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Sku, device::GENERAL, general::GET_SKU, &[])
            .await?;
        Ok(sensors::text(&frame))
    }

    // -----------------------------------------------------------------------
    // Motors
    // -----------------------------------------------------------------------

    /// Drive each wheel at the given speed in mm/s (`-100..=100`).
    pub async fn set_wheel_speeds(&self, left: i32, right: i32) -> Result<(), RoveError> {
        check_range("left wheel speed", i64::from(left), -i64::from(MAX_WHEEL_SPEED), i64::from(MAX_WHEEL_SPEED))?;
        check_range("right wheel speed", i64::from(right), -i64::from(MAX_WHEEL_SPEED), i64::from(MAX_WHEEL_SPEED))?;
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&left.to_be_bytes());
        payload[4..].copy_from_slice(&right.to_be_bytes());
        self.conn
            .send_without_response(device::MOTORS, motors::SET_SPEED, &payload)
            .await?;
        Ok(())
    }

    /// Drive straight for `distance_mm` and report the final pose.
    pub async fn drive_distance(&self, distance_mm: i32) -> Result<Pose, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::DriveDistance,
                device::MOTORS,
                motors::DRIVE_DISTANCE,
                &distance_mm.to_be_bytes(),
            )
            .await?;
        Ok(sensors::pose(&frame))
    }

    /// Rotate in place by `decidegrees` (positive is clockwise).
    pub async fn rotate_angle(&self, decidegrees: i32) -> Result<Pose, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::RotateAngle,
                device::MOTORS,
                motors::ROTATE_ANGLE,
                &decidegrees.to_be_bytes(),
            )
            .await?;
        Ok(sensors::pose(&frame))
    }

    pub async fn reset_position(&self) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::MOTORS, motors::RESET_POSITION, &[])
            .await?;
        Ok(())
    }

    pub async fn position(&self) -> Result<Pose, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Position, device::MOTORS, motors::GET_POSITION, &[])
            .await?;
        Ok(sensors::pose(&frame))
    }

    /// Drive to `(x, y)`; `heading` of `-1` leaves the final heading free.
    pub async fn navigate_to(&self, x: i32, y: i32, heading: i16) -> Result<Pose, RoveError> {
        check_range("heading", i64::from(heading), -1, 3599)?;
        let mut payload = [0u8; 10];
        payload[..4].copy_from_slice(&x.to_be_bytes());
        payload[4..8].copy_from_slice(&y.to_be_bytes());
        payload[8..].copy_from_slice(&heading.to_be_bytes());
        let frame = self
            .conn
            .send_with_response(
                EventKind::NavigateToPosition,
                device::MOTORS,
                motors::NAVIGATE_TO_POSITION,
                &payload,
            )
            .await?;
        Ok(sensors::pose(&frame))
    }

    /// Drive along an arc of `radius_mm` sweeping `decidegrees`.
    pub async fn drive_arc(&self, decidegrees: i32, radius_mm: i32) -> Result<Pose, RoveError> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&decidegrees.to_be_bytes());
        payload[4..].copy_from_slice(&radius_mm.to_be_bytes());
        let frame = self
            .conn
            .send_with_response(EventKind::DriveArc, device::MOTORS, motors::DRIVE_ARC, &payload)
            .await?;
        Ok(sensors::pose(&frame))
    }

    pub async fn dock(&self) -> Result<DockResult, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Dock, device::MOTORS, motors::DOCK, &[])
            .await?;
        Ok(DockResult::from_frame(&frame))
    }

    pub async fn undock(&self) -> Result<DockResult, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Undock, device::MOTORS, motors::UNDOCK, &[])
            .await?;
        Ok(DockResult::from_frame(&frame))
    }

    // -----------------------------------------------------------------------
    // LED and sound
    // -----------------------------------------------------------------------

    pub async fn set_led_animation(&self, animation: LedAnimation, rgb: [u8; 3]) -> Result<(), RoveError> {
        let payload = [animation.id(), rgb[0], rgb[1], rgb[2]];
        self.conn
            .send_without_response(device::LED, led::SET_ANIMATION, &payload)
            .await?;
        Ok(())
    }

    /// Play a tone and wait until it finishes.
    pub async fn play_note(&self, frequency_hz: u32, duration_ms: u16) -> Result<(), RoveError> {
        let mut payload = [0u8; 6];
        payload[..4].copy_from_slice(&frequency_hz.to_be_bytes());
        payload[4..].copy_from_slice(&duration_ms.to_be_bytes());
        self.conn
            .send_with_response(EventKind::NoteFinished, device::SOUND, sound::PLAY_NOTE, &payload)
            .await?;
        Ok(())
    }

    pub async fn stop_sound(&self) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::SOUND, sound::STOP, &[])
            .await?;
        Ok(())
    }

    /// Speak up to 16 bytes of text and wait until done.
    pub async fn say_phrase(&self, phrase: &str) -> Result<(), RoveError> {
        self.conn
            .send_with_response(EventKind::PhraseFinished, device::SOUND, sound::SAY_PHRASE, phrase.as_bytes())
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // IR proximity
    // -----------------------------------------------------------------------

    pub async fn ir_readings(&self) -> Result<IrReadings, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::IrProximityValues,
                device::IR_PROXIMITY,
                ir_proximity::GET_VALUES,
                &[],
            )
            .await?;
        Ok(IrReadings::from_frame(&frame))
    }

    pub async fn packed_ir_proximity(&self) -> Result<IrProximity, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::PackedIrProximity,
                device::IR_PROXIMITY,
                ir_proximity::GET_PACKED,
                &[],
            )
            .await?;
        Ok(IrProximity::from_frame(&frame))
    }

    pub async fn set_event_thresholds(&self, thresholds: &EventThresholds) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::IR_PROXIMITY, ir_proximity::SET_THRESHOLDS, &thresholds.to_payload())
            .await?;
        Ok(())
    }

    pub async fn event_thresholds(&self) -> Result<EventThresholds, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::EventThresholds,
                device::IR_PROXIMITY,
                ir_proximity::GET_THRESHOLDS,
                &[],
            )
            .await?;
        Ok(EventThresholds::from_frame(&frame))
    }

    /// Stream of unsolicited IR proximity events.
    pub fn ir_events(&self) -> Result<Subscription, RoveError> {
        self.conn.subscribe(EventKind::IrProximityEvent)
    }

    // -----------------------------------------------------------------------
    // Other sensors
    // -----------------------------------------------------------------------

    pub async fn battery(&self) -> Result<Battery, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::BatteryLevel, device::BATTERY, battery::GET_LEVEL, &[])
            .await?;
        Ok(Battery::from_frame(&frame))
    }

    pub async fn acceleration(&self) -> Result<Acceleration, RoveError> {
        let frame = self
            .conn
            .send_with_response(
                EventKind::Acceleration,
                device::ACCELEROMETER,
                accelerometer::GET_ACCELERATION,
                &[],
            )
            .await?;
        Ok(Acceleration::from_frame(&frame))
    }

    pub async fn docking_sensors(&self) -> Result<DockingSensors, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::DockingValues, device::DOCKING, docking::GET_VALUES, &[])
            .await?;
        Ok(DockingSensors::from_frame(&frame))
    }

    pub async fn ipv4_addresses(&self) -> Result<Ipv4Addresses, RoveError> {
        let frame = self
            .conn
            .send_with_response(EventKind::Ipv4Addresses, device::CONNECTIVITY, connectivity::GET_IPV4, &[])
            .await?;
        Ok(Ipv4Addresses::from_frame(&frame))
    }

    /// Start a firmware update; progress arrives as
    /// [`EventKind::UpdateProgress`] events.
    pub async fn request_update(&self) -> Result<(), RoveError> {
        self.conn
            .send_without_response(device::CONNECTIVITY, connectivity::REQUEST_UPDATE, &[0; MAX_PAYLOAD])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LinkConfig;
    use rove_types::Frame;
    use crate::sim::SimRobot;
    use rove_perception::sensors::UpdateProgress;

    async fn client(sim: &Arc<SimRobot>) -> RobotClient {
        RobotClient::new(Arc::new(Connection::open(sim.clone(), LinkConfig::default()).await))
    }

    #[tokio::test]
    async fn wheel_speed_frame_matches_wire_layout() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;
        robot.set_wheel_speeds(80, 80).await?;

        let written = sim.writes();
        let wire = written[0].encode();
        assert_eq!(&wire[..11], &[1, 4, 0, 0, 0, 0, 80, 0, 0, 0, 80]);
        assert!(wire[11..19].iter().all(|&b| b == 0));
        assert_eq!(wire[19], rove_types::crc8(&wire[..19]));
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_arguments_are_rejected_locally() {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert!(matches!(
            robot.set_wheel_speeds(101, 0).await,
            Err(RoveError::OutOfRange { value: 101, .. })
        ));
        assert!(matches!(
            robot.navigate_to(0, 0, 3600).await,
            Err(RoveError::OutOfRange { value: 3600, .. })
        ));
        assert_eq!(
            robot.set_name("a name far too long").await,
            Err(RoveError::PayloadTooLarge(19))
        );
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn motion_commands_report_pose() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert_eq!(robot.drive_distance(250).await?, Pose::new(250, 0, 0));
        assert_eq!(robot.rotate_angle(900).await?, Pose::new(250, 0, 900));
        assert_eq!(robot.navigate_to(10, 20, -1).await?, Pose::new(10, 20, 900));
        robot.reset_position().await?;
        assert_eq!(robot.position().await?, Pose::new(0, 0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn dock_and_undock_toggle_contacts() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert!(robot.dock().await?.docked);
        assert!(robot.docking_sensors().await?.is_docked());
        assert!(!robot.undock().await?.docked);
        assert!(!robot.docking_sensors().await?.is_docked());
        Ok(())
    }

    #[tokio::test]
    async fn thresholds_written_then_read_back() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;
        let wanted = EventThresholds {
            hysteresis: 30,
            thresholds: [200, 210, 220, 230, 240, 250, 260],
        };
        robot.set_event_thresholds(&wanted).await?;
        assert_eq!(robot.event_thresholds().await?, wanted);
        Ok(())
    }

    #[tokio::test]
    async fn general_queries() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        robot.set_name("Rovie").await?;
        assert_eq!(robot.name().await?, "Rovie");
        assert_eq!(robot.versions(Board::Main).await?.firmware, "S.1.4");
        assert_eq!(robot.sku().await?, "RT0-SIM");

        robot.enable_events(&[device::BUMPERS, device::IR_PROXIMITY]).await?;
        robot.disable_events(&[device::BUMPERS]).await?;
        assert_eq!(robot.enabled_events().await?.devices(), vec![device::IR_PROXIMITY]);
        Ok(())
    }

    #[tokio::test]
    async fn update_progress_arrives_as_event() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;
        let mut progress = robot.subscribe(EventKind::UpdateProgress)?;

        robot.request_update().await?;
        let frame = progress.recv().await.ok_or("subscription closed")?;
        assert_eq!(UpdateProgress::from_frame(&frame).percent, 100);
        Ok(())
    }

    #[tokio::test]
    async fn sensor_queries_decode() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert_eq!(robot.battery().await?.percent, 93);
        assert_eq!(robot.acceleration().await?.z, 1000);
        assert_eq!(robot.ipv4_addresses().await?.wlan0.to_string(), "127.0.0.1");
        assert_eq!(robot.packed_ir_proximity().await?.values, [0; 7]);
        robot.play_note(440, 100).await?;
        Ok(())
    }

    #[tokio::test]
    async fn drive_arc_sends_angle_then_radius() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert_eq!(robot.drive_arc(900, 200).await?, Pose::new(0, 0, 900));

        let wire = sim.writes()[0].encode();
        assert_eq!(&wire[..11], &[1, 27, 0, 0, 0, 0x03, 0x84, 0, 0, 0, 200]);
        assert!(wire[11..19].iter().all(|&b| b == 0));
        Ok(())
    }

    #[tokio::test]
    async fn led_and_sound_frames() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        robot.set_led_animation(LedAnimation::Blink, [255, 0, 64]).await?;
        robot.say_phrase("hello").await?;
        robot.stop_sound().await?;
        assert_eq!(
            robot.say_phrase("seventeen letters").await,
            Err(RoveError::PayloadTooLarge(17))
        );

        let written = sim.writes();
        assert_eq!(written.len(), 3);
        assert_eq!(&written[0].encode()[..7], &[3, 2, 0, 2, 255, 0, 64]);
        assert_eq!(&written[1].encode()[..8], &[5, 4, 1, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(written[2], Frame::new(device::SOUND, sound::STOP, 2, &[])?);
        Ok(())
    }

    #[tokio::test]
    async fn serial_number_fills_the_payload() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        assert_eq!(robot.serial_number().await?, "SIM0000000000001");
        assert_eq!(&sim.writes()[0].encode()[..3], &[0, 14, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn stop_and_reset_halts_the_wheels() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        robot.set_wheel_speeds(50, 50).await?;
        robot.stop_and_reset().await?;
        assert_eq!(robot.position().await?, Pose::new(0, 0, 0));
        assert_eq!(robot.position().await?, Pose::new(0, 0, 0));

        assert_eq!(sim.writes()[1], Frame::new(device::GENERAL, general::STOP_AND_RESET, 1, &[])?);
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_closes_the_link() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimRobot::new());
        let robot = client(&sim).await;

        robot.disconnect().await?;
        assert_eq!(sim.writes()[0], Frame::new(device::GENERAL, general::DISCONNECT, 0, &[])?);

        let after = tokio::time::timeout(std::time::Duration::from_secs(1), robot.battery()).await?;
        assert_eq!(after.unwrap_err(), RoveError::ConnectionClosed);
        Ok(())
    }
}
