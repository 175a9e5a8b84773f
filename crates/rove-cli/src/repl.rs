//! REPL – the interactive operator shell.
//!
//! Supported slash-commands:
//!   /help              – show this list
//!   /sweep             – run the undock → roam → avoid behavior in the background
//!   /stop              – emergency-stop the running behavior and print its report
//!   /status            – link and behavior status
//!   /battery           – battery voltage and charge
//!   /position          – dead-reckoned pose
//!   /dock | /undock    – run the firmware docking routines
//!   /ir                – raw and packed IR proximity readings
//!   /thresholds        – current IR event thresholds
//!   /name [new-name]   – read or set the robot name
//!   /versions          – main board firmware versions
//!   /diagnostics       – recent link notices as JSON lines
//!   /obstacle <0-6>    – (sim only) put an obstacle in front of one IR sensor
//!   /quit | /exit      – stop any behavior and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rove_middleware::{Connection, RobotClient, SimRobot, TcpTransport, Transport};
use rove_perception::IrProximity;
use rove_perception::ir::IR_SENSORS;
use rove_perception::sensors::Board;
use rove_runtime::{BehaviorMachine, BehaviorParams, BehaviorReport, BehaviorState, EmergencyStop, RobotLink};
use rove_types::protocol::{device, ir_proximity};
use rove_types::{Diagnostic, RoveError};

use crate::config::{Config, TransportKind};

/// How many link notices `/diagnostics` keeps.
const DIAGNOSTIC_HISTORY: usize = 64;

/// Slot holding the emergency stop of the behavior currently running, shared
/// with the Ctrl-C handler.
pub type ActiveStop = Arc<Mutex<Option<EmergencyStop>>>;

/// Trigger whatever behavior is running.  Returns `true` if one was.
pub fn trigger_active(active: &ActiveStop) -> bool {
    match active.lock() {
        Ok(slot) => match slot.as_ref() {
            Some(stop) => {
                stop.trigger();
                true
            }
            None => false,
        },
        Err(_) => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Sweep,
    Stop,
    Status,
    Battery,
    Position,
    Dock,
    Undock,
    Ir,
    Thresholds,
    Name(Option<String>),
    Versions,
    Diagnostics,
    Obstacle(usize),
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        let cmd = match head {
            "/help" => Command::Help,
            "/sweep" => Command::Sweep,
            "/stop" => Command::Stop,
            "/status" => Command::Status,
            "/battery" => Command::Battery,
            "/position" => Command::Position,
            "/dock" => Command::Dock,
            "/undock" => Command::Undock,
            "/ir" => Command::Ir,
            "/thresholds" => Command::Thresholds,
            "/name" if rest.is_empty() => Command::Name(None),
            "/name" => Command::Name(Some(rest.to_string())),
            "/versions" => Command::Versions,
            "/diagnostics" => Command::Diagnostics,
            "/obstacle" => {
                let sensor = rest
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s < IR_SENSORS)
                    .ok_or_else(|| format!("/obstacle takes a sensor index 0-{}", IR_SENSORS - 1))?;
                Command::Obstacle(sensor)
            }
            "/quit" | "/exit" => Command::Quit,
            other => return Err(format!("unknown command '{other}'")),
        };
        if !rest.is_empty() && !matches!(cmd, Command::Name(_) | Command::Obstacle(_)) {
            return Err(format!("{head} takes no arguments"));
        }
        Ok(cmd)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One open robot link plus the behavior running on it, if any.
pub struct Session {
    client: RobotClient,
    sim: Option<Arc<SimRobot>>,
    params: BehaviorParams,
    active: ActiveStop,
    sweep: Option<JoinHandle<Result<BehaviorReport, RoveError>>>,
    notices: Arc<Mutex<VecDeque<Diagnostic>>>,
}

impl Session {
    /// Open the transport named in `cfg` and start collecting diagnostics.
    pub async fn open(cfg: &Config, active: ActiveStop) -> Result<Self, RoveError> {
        let (transport, sim): (Arc<dyn Transport>, Option<Arc<SimRobot>>) = match cfg.transport.kind {
            TransportKind::Sim => {
                let sim = Arc::new(SimRobot::new().docked(true));
                (sim.clone(), Some(sim))
            }
            TransportKind::Tcp => (Arc::new(TcpTransport::connect(&cfg.transport.tcp_addr).await?), None),
        };
        let conn = Arc::new(Connection::open(transport, cfg.link_config()).await);

        let notices = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_HISTORY)));
        tokio::spawn(collect_diagnostics(conn.clone(), notices.clone()));

        Ok(Self {
            client: RobotClient::new(conn),
            sim,
            params: cfg.behavior_params(),
            active,
            sweep: None,
            notices,
        })
    }

    pub fn client(&self) -> &RobotClient {
        &self.client
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.client.connection()
    }

    /// Print the report of a behavior that ended on its own.
    pub async fn reap(&mut self) {
        if self.sweep.as_ref().is_some_and(|h| h.is_finished()) {
            self.finish_sweep().await;
        }
    }

    /// Execute one command.  Returns `false` when the shell should exit.
    pub async fn handle(&mut self, cmd: Command) -> Result<bool, RoveError> {
        match cmd {
            Command::Help => cmd_help(),
            Command::Sweep => self.cmd_sweep(),
            Command::Stop => self.cmd_stop().await,
            Command::Status => self.cmd_status(),
            Command::Battery => {
                let b = self.client.battery().await?;
                println!("  Battery: {} mV ({}%)", b.millivolts.to_string().bold(), b.percent);
            }
            Command::Position => {
                let p = self.client.position().await?;
                println!(
                    "  Pose: x = {} mm, y = {} mm, heading = {:.1}°",
                    p.x.to_string().bold(),
                    p.y.to_string().bold(),
                    f64::from(p.heading) / 10.0
                );
            }
            Command::Dock => {
                let r = self.client.dock().await?;
                println!("  Dock: {:?} (docked: {})", r.status, r.docked);
            }
            Command::Undock => {
                let r = self.client.undock().await?;
                println!("  Undock: {:?} (docked: {})", r.status, r.docked);
            }
            Command::Ir => {
                let raw = self.client.ir_readings().await?;
                let packed = self.client.packed_ir_proximity().await?;
                println!("  Raw (first six): {:?}", raw.values);
                println!("  Packed values:   {:?}", packed.values);
                let marks: String = packed.triggered.iter().map(|t| if *t { '●' } else { '·' }).collect();
                println!("  Triggered:       {}", marks.yellow());
            }
            Command::Thresholds => {
                let t = self.client.event_thresholds().await?;
                println!("  Hysteresis: {}", t.hysteresis);
                println!("  Thresholds: {:?}", t.thresholds);
            }
            Command::Name(None) => println!("  Name: {}", self.client.name().await?.bold()),
            Command::Name(Some(name)) => {
                self.client.set_name(&name).await?;
                println!("  {} Name set to {}", "✓".green(), name.bold());
            }
            Command::Versions => {
                let v = self.client.versions(Board::Main).await?;
                println!("  Firmware:   {}", v.firmware.bold());
                println!("  Hardware:   {}", v.hardware);
                println!("  Bootloader: {}", v.bootloader);
                println!("  Protocol:   {}", v.protocol);
            }
            Command::Diagnostics => self.cmd_diagnostics(),
            Command::Obstacle(sensor) => self.cmd_obstacle(sensor),
            Command::Quit => {
                if self.sweep.is_some() {
                    self.cmd_stop().await;
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn cmd_sweep(&mut self) {
        if self.sweep.is_some() {
            println!("  {} a behavior is already running; {} it first", "Busy:".yellow(), "/stop".bold());
            return;
        }
        let stop = EmergencyStop::new();
        if let Ok(mut slot) = self.active.lock() {
            *slot = Some(stop.clone());
        }
        let link: Arc<dyn RobotLink> = Arc::new(self.client.clone());
        let mut machine = BehaviorMachine::new(link, self.params.clone(), stop);
        self.sweep = Some(tokio::spawn(async move { machine.run(BehaviorState::start()).await }));
        println!("  {} behavior started. Type {} to halt.", "▶".green(), "/stop".bold());
    }

    async fn cmd_stop(&mut self) {
        if !trigger_active(&self.active) {
            println!("  No behavior is running.");
            return;
        }
        self.finish_sweep().await;
    }

    async fn finish_sweep(&mut self) {
        let Some(handle) = self.sweep.take() else {
            return;
        };
        if let Ok(mut slot) = self.active.lock() {
            *slot = None;
        }
        match handle.await {
            Ok(Ok(report)) => print_report(&report),
            Ok(Err(e)) => println!("  {} {}", "Behavior aborted:".red(), e),
            Err(e) => println!("  {} {}", "Behavior task failed:".red(), e),
        }
    }

    fn cmd_status(&self) {
        let conn = self.connection();
        println!("{}", "Link Status".bold().underline());
        println!("  Connection : {}", conn.id().to_string().dimmed());
        println!(
            "  Transport  : {}",
            if self.sim.is_some() { "simulator" } else { "tcp" }
        );
        if conn.is_closed() {
            println!("  State      : {}", "closed".red());
        } else {
            println!("  State      : {}", "open".green());
        }
        println!("  In flight  : {}", conn.in_flight());
        let behavior = if self.sweep.is_some() { "running".green() } else { "idle".dimmed() };
        println!("  Behavior   : {}", behavior);
    }

    fn cmd_diagnostics(&self) {
        let notices: Vec<Diagnostic> = match self.notices.lock() {
            Ok(n) => n.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        if notices.is_empty() {
            println!("  No link notices recorded.");
            return;
        }
        for d in &notices {
            match serde_json::to_string(d) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialize link notice"),
            }
        }
    }

    fn cmd_obstacle(&self, sensor: usize) {
        let Some(sim) = &self.sim else {
            println!("  {} /obstacle only works with the simulator", "Unavailable:".yellow());
            return;
        };
        let mut values = [0u16; IR_SENSORS];
        values[sensor] = 4000;
        sim.set_obstacle(values, 2);

        let limits = sim.thresholds().thresholds;
        let mut triggered = [false; IR_SENSORS];
        for i in 0..IR_SENSORS {
            triggered[i] = values[i] > limits[i];
        }
        let sample = IrProximity {
            timestamp_ms: 0,
            triggered,
            values,
        };
        sim.emit_event(device::IR_PROXIMITY, ir_proximity::EVENT, &sample.to_payload()[4..]);
        println!("  Obstacle placed in front of sensor {}.", sensor.to_string().bold());
    }
}

async fn collect_diagnostics(conn: Arc<Connection>, notices: Arc<Mutex<VecDeque<Diagnostic>>>) {
    let mut rx = conn.diagnostics();
    drop(conn);
    loop {
        match rx.recv().await {
            Ok(diag) => {
                debug!(notice = ?diag.notice, "link notice");
                if let Ok(mut n) = notices.lock() {
                    if n.len() == DIAGNOSTIC_HISTORY {
                        n.pop_front();
                    }
                    n.push_back(diag);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "diagnostics collector lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(runtime: &Runtime, mut session: Session, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            runtime.block_on(session.handle(Command::Quit)).ok();
            break;
        }
        runtime.block_on(session.reap());

        let line = match editor.readline("rove> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "⚠  Ctrl-C – halting.".yellow().bold());
                shutdown.store(true, Ordering::SeqCst);
                continue;
            }
            Err(ReadlineError::Eof) => {
                shutdown.store(true, Ordering::SeqCst);
                continue;
            }
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                shutdown.store(true, Ordering::SeqCst);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        editor.add_history_entry(line.as_str()).ok();

        let cmd = match Command::parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                continue;
            }
        };
        match runtime.block_on(session.handle(cmd)) {
            Ok(true) => {}
            Ok(false) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Err(e) => println!("  {} {}", "Command failed:".red(), e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Rove Commands".bold().underline());
    println!("  {}           – undock, roam and avoid obstacles", "/sweep".bold().cyan());
    println!("  {}            – emergency-stop the behavior", "/stop".bold().cyan());
    println!("  {}          – link and behavior status", "/status".bold().cyan());
    println!("  {} – battery, pose, IR readings", "/battery /position /ir".bold().cyan());
    println!("  {}   – firmware docking routines", "/dock /undock".bold().cyan());
    println!("  {}      – IR event thresholds", "/thresholds".bold().cyan());
    println!("  {}     – read or set the robot name", "/name [new]".bold().cyan());
    println!("  {}        – firmware versions", "/versions".bold().cyan());
    println!("  {}     – recent link notices (JSON)", "/diagnostics".bold().cyan());
    println!("  {}   – simulator: obstacle at sensor", "/obstacle <n>".bold().cyan());
    println!("  {}    – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn print_report(report: &BehaviorReport) {
    let path: Vec<String> = report.visited.iter().map(|s| s.to_string()).collect();
    println!("{}", "Behavior Report".bold().underline());
    println!("  States  : {}", path.join(" → "));
    match report.docked {
        Some(docked) => println!("  Docked  : {}", docked),
        None => println!("  Docked  : {}", "unknown".dimmed()),
    }
    if report.emergency_stopped {
        println!("  Ended by: {}", "emergency stop".yellow().bold());
    } else {
        println!("  Ended by: {}", "halt".green());
    }
}
