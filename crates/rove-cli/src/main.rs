//! `rove-cli` – operator console for the rove robot
//!
//! This binary:
//!
//! 1. Checks for `~/.rove/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Opens the robot link (built-in simulator or a TCP frame bridge) and
//!    reports the firmware it finds.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/sweep`, `/stop`, `/battery`, `/diagnostics`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to trigger the running behavior's emergency stop
//!    and exit safely.

mod config;
mod repl;

use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use rove_perception::sensors::Board;

fn main() {
    // See rove_runtime::telemetry for RUST_LOG, ROVE_LOG_FORMAT,
    // ROVE_TRACE_FRAMES and OTEL_EXPORTER_OTLP_ENDPOINT.
    let _telemetry = rove_runtime::init_tracing("rove");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let active: repl::ActiveStop = Arc::new(Mutex::new(None));

    {
        let shutdown = shutdown.clone();
        let active = active.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – initiating emergency stop …".yellow().bold());
            if repl::trigger_active(&active) {
                println!("{}", "  ✓ Running behavior halted.".green());
            }
            println!("{}", "  ✓ Exiting rove.".green());
            shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; emergency stop on Ctrl-C will not be available");
        }
    }

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return;
        }
    };

    let target = match cfg.transport.kind {
        config::TransportKind::Sim => "built-in simulator".to_string(),
        config::TransportKind::Tcp => cfg.transport.tcp_addr.clone(),
    };
    print!("\n  Connecting to {} … ", target.dimmed());
    std::io::Write::flush(&mut std::io::stdout()).ok();
    let session = match runtime.block_on(repl::Session::open(&cfg, active)) {
        Ok(session) => session,
        Err(e) => {
            println!("{}", "failed".red());
            println!("  {}", e.to_string().dimmed());
            return;
        }
    };
    println!("{}", "connected".green());
    info!(conn = %session.connection().id(), transport = %cfg.transport.kind, "link open");

    match runtime.block_on(session.client().versions(Board::Main)) {
        Ok(v) => println!("  Firmware {} (protocol {})", v.firmware.bold(), v.protocol),
        Err(e) => println!("  {} {}", "Version query failed:".yellow(), e),
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&runtime, session, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Rove First-Run Wizard         ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up rove.\n");

    let mut cfg = config::Config::default();

    println!("  How should rove reach the robot?");
    println!("    1) Built-in simulator  (default)");
    println!("    2) TCP frame bridge");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.transport.kind = config::TransportKind::Tcp;
        cfg.transport.tcp_addr = prompt_line(
            &format!("  Bridge address [{}]: ", cfg.transport.tcp_addr),
            &cfg.transport.tcp_addr,
        );
    }

    let speed = prompt_line(
        &format!("  Roam speed in mm/s [{}]: ", cfg.behavior.roam_speed),
        &cfg.behavior.roam_speed.to_string(),
    );
    match speed.trim().parse::<i32>() {
        Ok(s) if (1..=rove_middleware::commands::MAX_WHEEL_SPEED).contains(&s) => cfg.behavior.roam_speed = s,
        _ => println!(
            "  {} '{}' is not a valid speed, keeping {}",
            "Warning:".yellow(),
            speed,
            cfg.behavior.roam_speed
        ),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____ ___ _  _____ "#.bold().cyan());
    println!("{}", r#"  / __/ _ \ |/ / -_) "#.bold().cyan());
    println!("{}", r#" /_/  \___/___/\__/  "#.bold().cyan());
    println!();
    println!("  {} {}", "rove".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Wheeled robot control console");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
