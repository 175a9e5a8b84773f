//! Operator configuration – reads/writes `~/.rove/config.toml`.
//!
//! ```toml
//! [transport]
//! kind = "tcp"
//! tcp_addr = "192.168.4.1:9000"
//!
//! [link]
//! busy_retry_interval_ms = 20
//! max_busy_retries = 50
//!
//! [behavior]
//! roam_speed = 80
//! thresholds = [150, 150, 150, 150, 150, 150, 150]
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rove_middleware::LinkConfig;
use rove_perception::EventThresholds;
use rove_perception::ir::IR_SENSORS;
use rove_runtime::BehaviorParams;

/// Which link the CLI opens at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process simulated robot.
    #[default]
    Sim,
    /// Raw 20-byte frames over a TCP bridge.
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sim => write!(f, "sim"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sim" => Ok(TransportKind::Sim),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(format!("unknown transport '{other}' (expected sim or tcp)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub kind: TransportKind,
    /// `host:port` of the frame bridge; only read when `kind = "tcp"`.
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSection {
    #[serde(default = "default_busy_retry_interval_ms")]
    pub busy_retry_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_busy_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSection {
    #[serde(default = "default_roam_speed")]
    pub roam_speed: i32,
    #[serde(default = "default_undock_speed")]
    pub undock_speed: i32,
    #[serde(default = "default_undock_clearance_mm")]
    pub undock_clearance_mm: f64,
    #[serde(default = "default_steering_limit")]
    pub steering_limit: i32,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u16,
    #[serde(default = "default_thresholds")]
    pub thresholds: [u16; IR_SENSORS],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threshold_attempts: Option<u32>,
}

/// Persisted operator configuration stored in `~/.rove/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub behavior: BehaviorSection,
}

fn default_tcp_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_busy_retry_interval_ms() -> u64 {
    20
}
fn default_roam_speed() -> i32 {
    80
}
fn default_undock_speed() -> i32 {
    -80
}
fn default_undock_clearance_mm() -> f64 {
    300.0
}
fn default_steering_limit() -> i32 {
    70
}
fn default_hysteresis() -> u16 {
    EventThresholds::default().hysteresis
}
fn default_thresholds() -> [u16; IR_SENSORS] {
    EventThresholds::default().thresholds
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            tcp_addr: default_tcp_addr(),
        }
    }
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            busy_retry_interval_ms: default_busy_retry_interval_ms(),
            max_busy_retries: None,
        }
    }
}

impl Default for BehaviorSection {
    fn default() -> Self {
        Self {
            roam_speed: default_roam_speed(),
            undock_speed: default_undock_speed(),
            undock_clearance_mm: default_undock_clearance_mm(),
            steering_limit: default_steering_limit(),
            hysteresis: default_hysteresis(),
            thresholds: default_thresholds(),
            max_threshold_attempts: None,
        }
    }
}

impl Config {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            busy_retry_interval: Duration::from_millis(self.link.busy_retry_interval_ms),
            max_busy_retries: self.link.max_busy_retries,
        }
    }

    pub fn behavior_params(&self) -> BehaviorParams {
        let b = &self.behavior;
        BehaviorParams {
            roam_speed: b.roam_speed,
            undock_speed: b.undock_speed,
            undock_clearance_mm: b.undock_clearance_mm,
            steering_limit: b.steering_limit,
            thresholds: EventThresholds {
                hysteresis: b.hysteresis,
                thresholds: b.thresholds,
            },
            max_threshold_attempts: b.max_threshold_attempts,
            ..BehaviorParams::default()
        }
    }

    /// Reject values the robot would refuse mid-run.
    pub fn validate(&self) -> Result<(), String> {
        let max = rove_middleware::commands::MAX_WHEEL_SPEED;
        let b = &self.behavior;
        for (name, value) in [
            ("roam_speed", b.roam_speed),
            ("undock_speed", b.undock_speed),
            ("steering_limit", b.steering_limit),
        ] {
            if !(-max..=max).contains(&value) {
                return Err(format!("behavior.{name} = {value} is outside -{max}..={max}"));
            }
        }
        if b.undock_speed >= 0 {
            return Err("behavior.undock_speed must be negative".to_string());
        }
        if b.steering_limit < 0 {
            return Err("behavior.steering_limit must not be negative".to_string());
        }
        if !b.undock_clearance_mm.is_finite() || b.undock_clearance_mm <= 0.0 {
            return Err("behavior.undock_clearance_mm must be positive".to_string());
        }
        if self.link.busy_retry_interval_ms == 0 {
            return Err("link.busy_retry_interval_ms must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Return the path to `~/.rove/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rove").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `ROVE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROVE_TRANSPORT` | `transport.kind` |
/// | `ROVE_TCP_ADDR` | `transport.tcp_addr` |
/// | `ROVE_ROAM_SPEED` | `behavior.roam_speed` |
/// | `ROVE_MAX_THRESHOLD_ATTEMPTS` | `behavior.max_threshold_attempts` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ROVE_TRANSPORT")
        && let Ok(kind) = v.parse::<TransportKind>()
    {
        cfg.transport.kind = kind;
    }
    if let Ok(v) = std::env::var("ROVE_TCP_ADDR") {
        cfg.transport.tcp_addr = v;
    }
    if let Ok(v) = std::env::var("ROVE_ROAM_SPEED")
        && let Ok(speed) = v.parse::<i32>()
    {
        cfg.behavior.roam_speed = speed;
    }
    if let Ok(v) = std::env::var("ROVE_MAX_THRESHOLD_ATTEMPTS")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.behavior.max_threshold_attempts = Some(n);
    }
}

/// Save the config to disk, creating `~/.rove/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.transport.kind, TransportKind::Sim);
        assert_eq!(loaded.behavior.roam_speed, 80);
        assert_eq!(loaded.behavior.thresholds, [150; IR_SENSORS]);
        assert_eq!(loaded.link.max_busy_retries, None);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let raw = "[transport]\nkind = \"tcp\"\ntcp_addr = \"10.0.0.7:9000\"\n\n[link]\nmax_busy_retries = 5\n";
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.transport.kind, TransportKind::Tcp);
        assert_eq!(cfg.transport.tcp_addr, "10.0.0.7:9000");
        assert_eq!(cfg.link.max_busy_retries, Some(5));
        assert_eq!(cfg.link.busy_retry_interval_ms, 20);
        assert_eq!(cfg.behavior, BehaviorSection::default());
    }

    #[test]
    fn out_of_range_speed_is_rejected_on_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "[behavior]\nundock_speed = -250\n").expect("write");

        let err = load_from(&path).expect_err("must reject");
        assert!(err.contains("undock_speed"));
    }

    #[test]
    fn forward_undock_speed_is_rejected() {
        let mut cfg = Config::default();
        cfg.behavior.undock_speed = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn behavior_params_carry_thresholds() {
        let mut cfg = Config::default();
        cfg.behavior.hysteresis = 5;
        cfg.behavior.thresholds[0] = 400;
        cfg.behavior.max_threshold_attempts = Some(3);

        let params = cfg.behavior_params();
        assert_eq!(params.thresholds.hysteresis, 5);
        assert_eq!(params.thresholds.thresholds[0], 400);
        assert_eq!(params.max_threshold_attempts, Some(3));
        assert_eq!(params.turn_decidegrees, BehaviorParams::default().turn_decidegrees);
    }

    #[test]
    fn link_config_converts_interval() {
        let mut cfg = Config::default();
        cfg.link.busy_retry_interval_ms = 35;
        assert_eq!(cfg.link_config().busy_retry_interval, Duration::from_millis(35));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn config_path_points_to_rove_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".rove"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn transport_kind_parses_case_insensitively() {
        assert_eq!("TCP".parse::<TransportKind>(), Ok(TransportKind::Tcp));
        assert_eq!(" sim ".parse::<TransportKind>(), Ok(TransportKind::Sim));
        assert!("serial".parse::<TransportKind>().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_tcp_addr() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ROVE_TCP_ADDR", "robot.local:7000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.transport.tcp_addr, "robot.local:7000");
        unsafe { std::env::remove_var("ROVE_TCP_ADDR") };
    }

    #[test]
    fn apply_env_overrides_sets_threshold_attempts() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ROVE_MAX_THRESHOLD_ATTEMPTS", "4") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.behavior.max_threshold_attempts, Some(4));
        unsafe { std::env::remove_var("ROVE_MAX_THRESHOLD_ATTEMPTS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_speed() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ROVE_ROAM_SPEED", "fast") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.behavior.roam_speed, 80);
        unsafe { std::env::remove_var("ROVE_ROAM_SPEED") };
    }
}
