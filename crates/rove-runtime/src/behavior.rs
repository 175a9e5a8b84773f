//! Autonomous behavior chain.
//!
//! ```text
//! SetEventThresholds ──▶ Undock ──▶ Roam ◀──▶ Obstacle
//!                          │  ▲       ▲
//!                   unknown│  │docked │
//!                          ▼  │       │
//!                       IsDocked      │
//!                          Undock(docked) ──▶ Reversing ──▶ TurnAround
//! ```
//!
//! | State | Action | Next |
//! |---|---|---|
//! | `SetEventThresholds` | write hysteresis + thresholds, read them back | `Undock` on an exact match, otherwise itself |
//! | `IsDocked` | query dock contacts, record the flag | `Undock` |
//! | `Undock` | nothing / fix the clearance line and start reversing | `IsDocked`, `Roam` or `Reversing` |
//! | `Reversing` | poll pose against the clearance line | itself, or `TurnAround` after stopping |
//! | `TurnAround` | rotate 180° | `Roam` |
//! | `Roam` | drive forward, wait for an IR proximity event | `Obstacle` |
//! | `Obstacle` | poll packed IR, steer away | itself while triggered, `Roam` when clear |
//! | `Halt` | zero both wheels | terminal |
//!
//! Each [`BehaviorMachine::step`] performs one state's action and returns the
//! next state, so single transitions can be tested against a scripted
//! [`RobotLink`]. [`BehaviorMachine::run`] drives the chain and races every
//! step against the shared [`EmergencyStop`]: when it fires the current step
//! is dropped (releasing any subscription it held) and the machine halts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rove_middleware::RobotClient;
use rove_perception::ir::{EventThresholds, IrProximity};
use rove_perception::navigation::{ClearanceLine, WheelSpeeds, avoidance_speeds};
use rove_perception::sensors::DockingSensors;
use rove_types::{Pose, RoveError};
use tracing::{debug, info, trace, warn};

use crate::emergency::EmergencyStop;

// ─────────────────────────────────────────────────────────────────────────────
// Robot seam
// ─────────────────────────────────────────────────────────────────────────────

/// The robot operations the behaviors need.
#[async_trait]
pub trait RobotLink: Send + Sync {
    async fn set_wheel_speeds(&self, speeds: WheelSpeeds) -> Result<(), RoveError>;

    async fn position(&self) -> Result<Pose, RoveError>;

    async fn rotate_angle(&self, decidegrees: i32) -> Result<Pose, RoveError>;

    async fn docking_sensors(&self) -> Result<DockingSensors, RoveError>;

    async fn set_event_thresholds(&self, thresholds: &EventThresholds) -> Result<(), RoveError>;

    async fn event_thresholds(&self) -> Result<EventThresholds, RoveError>;

    async fn packed_ir_proximity(&self) -> Result<IrProximity, RoveError>;

    /// IR proximity events until the stream is dropped.
    fn proximity_events(&self) -> Result<BoxStream<'static, IrProximity>, RoveError>;
}

#[async_trait]
impl RobotLink for RobotClient {
    async fn set_wheel_speeds(&self, speeds: WheelSpeeds) -> Result<(), RoveError> {
        RobotClient::set_wheel_speeds(self, speeds.left, speeds.right).await
    }

    async fn position(&self) -> Result<Pose, RoveError> {
        RobotClient::position(self).await
    }

    async fn rotate_angle(&self, decidegrees: i32) -> Result<Pose, RoveError> {
        RobotClient::rotate_angle(self, decidegrees).await
    }

    async fn docking_sensors(&self) -> Result<DockingSensors, RoveError> {
        RobotClient::docking_sensors(self).await
    }

    async fn set_event_thresholds(&self, thresholds: &EventThresholds) -> Result<(), RoveError> {
        RobotClient::set_event_thresholds(self, thresholds).await
    }

    async fn event_thresholds(&self) -> Result<EventThresholds, RoveError> {
        RobotClient::event_thresholds(self).await
    }

    async fn packed_ir_proximity(&self) -> Result<IrProximity, RoveError> {
        RobotClient::packed_ir_proximity(self).await
    }

    fn proximity_events(&self) -> Result<BoxStream<'static, IrProximity>, RoveError> {
        let subscription = self.ir_events()?;
        Ok(stream::unfold(subscription, |mut sub| async move {
            sub.recv()
                .await
                .map(|frame| (IrProximity::from_frame(&frame), sub))
        })
        .boxed())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BehaviorState {
    /// `attempt` starts at 1.
    SetEventThresholds { attempt: u32 },
    IsDocked,
    Undock,
    Reversing { line: ClearanceLine },
    TurnAround,
    Roam,
    Obstacle,
    Halt,
}

impl BehaviorState {
    /// Head of the full chain.
    pub fn start() -> Self {
        BehaviorState::SetEventThresholds { attempt: 1 }
    }

    pub fn name(&self) -> StateName {
        match self {
            BehaviorState::SetEventThresholds { .. } => StateName::SetEventThresholds,
            BehaviorState::IsDocked => StateName::IsDocked,
            BehaviorState::Undock => StateName::Undock,
            BehaviorState::Reversing { .. } => StateName::Reversing,
            BehaviorState::TurnAround => StateName::TurnAround,
            BehaviorState::Roam => StateName::Roam,
            BehaviorState::Obstacle => StateName::Obstacle,
            BehaviorState::Halt => StateName::Halt,
        }
    }
}

/// Payload-free state label used in logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateName {
    SetEventThresholds,
    IsDocked,
    Undock,
    Reversing,
    TurnAround,
    Roam,
    Obstacle,
    Halt,
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters and report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorParams {
    /// Forward speed while roaming, mm/s.
    pub roam_speed: i32,
    /// Reverse speed while undocking, mm/s (negative).
    pub undock_speed: i32,
    /// How far behind the dock pose the clearance line sits.
    pub undock_clearance_mm: f64,
    /// In-place turn after undocking.
    pub turn_decidegrees: i32,
    /// Wheel speed bound while avoiding obstacles.
    pub steering_limit: i32,
    pub thresholds: EventThresholds,
    /// `None` rewrites until the read-back matches.
    pub max_threshold_attempts: Option<u32>,
    /// Pause before repeating a step that failed with a busy link.
    pub retry_interval: Duration,
}

impl Default for BehaviorParams {
    fn default() -> Self {
        Self {
            roam_speed: 80,
            undock_speed: -80,
            undock_clearance_mm: 300.0,
            turn_decidegrees: 1800,
            steering_limit: 70,
            thresholds: EventThresholds::default(),
            max_threshold_attempts: None,
            retry_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorReport {
    /// States entered, consecutive repeats collapsed.
    pub visited: Vec<StateName>,
    pub docked: Option<bool>,
    pub emergency_stopped: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Machine
// ─────────────────────────────────────────────────────────────────────────────

pub struct BehaviorMachine {
    link: Arc<dyn RobotLink>,
    params: BehaviorParams,
    stop: EmergencyStop,
    docked: Option<bool>,
}

impl BehaviorMachine {
    pub fn new(link: Arc<dyn RobotLink>, params: BehaviorParams, stop: EmergencyStop) -> Self {
        Self {
            link,
            params,
            stop,
            docked: None,
        }
    }

    /// Skip the dock query when the status is already known.
    pub fn with_docked(mut self, docked: bool) -> Self {
        self.docked = Some(docked);
        self
    }

    pub fn docked(&self) -> Option<bool> {
        self.docked
    }

    pub fn stop_handle(&self) -> EmergencyStop {
        self.stop.clone()
    }

    /// Run the chain from `start` until it halts.
    ///
    /// Busy-link failures repeat the failed step. Any other error zeroes the
    /// wheels (best effort) and is returned.
    pub async fn run(&mut self, start: BehaviorState) -> Result<BehaviorReport, RoveError> {
        let mut state = start;
        let mut visited: Vec<StateName> = Vec::new();
        let mut emergency_stopped = false;

        loop {
            let name = state.name();
            if visited.last() != Some(&name) {
                info!(state = %name, "entering state");
                visited.push(name);
            }
            if matches!(state, BehaviorState::Halt) {
                self.halt().await?;
                break;
            }
            if self.stop.is_triggered() {
                warn!(state = %name, "emergency stop");
                emergency_stopped = true;
                state = BehaviorState::Halt;
                continue;
            }

            let stop = self.stop.clone();
            let outcome = tokio::select! {
                biased;
                _ = stop.triggered() => None,
                result = self.step(&state) => Some(result),
            };
            match outcome {
                None => {
                    warn!(state = %name, "emergency stop");
                    emergency_stopped = true;
                    state = BehaviorState::Halt;
                }
                Some(Ok(next)) => state = next,
                Some(Err(err)) if is_retryable(&err) => {
                    warn!(state = %name, error = %err, "step failed, repeating");
                    tokio::time::sleep(self.params.retry_interval).await;
                }
                Some(Err(err)) => {
                    warn!(state = %name, error = %err, "behavior aborted");
                    if let Err(e) = self.halt().await {
                        debug!(error = %e, "could not zero wheels");
                    }
                    return Err(err);
                }
            }
        }

        Ok(BehaviorReport {
            visited,
            docked: self.docked,
            emergency_stopped,
        })
    }

    /// Perform one state's action and return the state that follows.
    pub async fn step(&mut self, state: &BehaviorState) -> Result<BehaviorState, RoveError> {
        match state {
            BehaviorState::SetEventThresholds { attempt } => self.set_event_thresholds(*attempt).await,
            BehaviorState::IsDocked => {
                let docked = self.link.docking_sensors().await?.is_docked();
                info!(docked, "dock status");
                self.docked = Some(docked);
                Ok(BehaviorState::Undock)
            }
            BehaviorState::Undock => self.undock().await,
            BehaviorState::Reversing { line } => self.reverse(line).await,
            BehaviorState::TurnAround => {
                let pose = self.link.rotate_angle(self.params.turn_decidegrees).await?;
                debug!(heading = pose.heading, "turned around");
                self.docked = Some(false);
                Ok(BehaviorState::Roam)
            }
            BehaviorState::Roam => self.roam().await,
            BehaviorState::Obstacle => self.avoid().await,
            BehaviorState::Halt => {
                self.halt().await?;
                Ok(BehaviorState::Halt)
            }
        }
    }

    async fn set_event_thresholds(&mut self, attempt: u32) -> Result<BehaviorState, RoveError> {
        let wanted = self.params.thresholds;
        self.link.set_event_thresholds(&wanted).await?;
        let read_back = self.link.event_thresholds().await?;
        if read_back == wanted {
            debug!(attempt, "event thresholds confirmed");
            return Ok(BehaviorState::Undock);
        }
        warn!(attempt, ?read_back, "event thresholds read back differently");
        if self
            .params
            .max_threshold_attempts
            .is_some_and(|max| attempt >= max)
        {
            return Err(RoveError::ThresholdsNotConverged(attempt));
        }
        Ok(BehaviorState::SetEventThresholds { attempt: attempt + 1 })
    }

    async fn undock(&mut self) -> Result<BehaviorState, RoveError> {
        match self.docked {
            None => Ok(BehaviorState::IsDocked),
            Some(false) => Ok(BehaviorState::Roam),
            Some(true) => {
                let start = self.link.position().await?;
                let line = ClearanceLine::behind(&start, self.params.undock_clearance_mm);
                let v = self.params.undock_speed;
                self.link.set_wheel_speeds(WheelSpeeds::new(v, v)).await?;
                info!(x = start.x, y = start.y, heading = start.heading, "reversing off the dock");
                Ok(BehaviorState::Reversing { line })
            }
        }
    }

    async fn reverse(&mut self, line: &ClearanceLine) -> Result<BehaviorState, RoveError> {
        let pose = self.link.position().await?;
        if !line.is_cleared(&pose) {
            trace!(x = pose.x, y = pose.y, side = line.side(&pose), "still over the dock");
            return Ok(BehaviorState::Reversing { line: *line });
        }
        self.link.set_wheel_speeds(WheelSpeeds::stopped()).await?;
        info!(x = pose.x, y = pose.y, "clear of the dock");
        Ok(BehaviorState::TurnAround)
    }

    async fn roam(&mut self) -> Result<BehaviorState, RoveError> {
        // Subscribe before moving so an event raised by the speed change is
        // not missed.
        let mut events = self.link.proximity_events()?;
        let v = self.params.roam_speed;
        self.link.set_wheel_speeds(WheelSpeeds::new(v, v)).await?;
        match events.next().await {
            Some(sample) => {
                info!(triggered = ?sample.triggered, "obstacle ahead");
                Ok(BehaviorState::Obstacle)
            }
            None => Err(RoveError::ConnectionClosed),
        }
    }

    async fn avoid(&mut self) -> Result<BehaviorState, RoveError> {
        let sample = self.link.packed_ir_proximity().await?;
        match avoidance_speeds(&sample, self.params.steering_limit) {
            Some(speeds) => {
                self.link.set_wheel_speeds(speeds).await?;
                Ok(BehaviorState::Obstacle)
            }
            None => {
                debug!("path clear");
                Ok(BehaviorState::Roam)
            }
        }
    }

    async fn halt(&self) -> Result<(), RoveError> {
        self.link.set_wheel_speeds(WheelSpeeds::stopped()).await
    }
}

fn is_retryable(err: &RoveError) -> bool {
    matches!(err, RoveError::TransportBusy | RoveError::SequenceExhausted)
}
