//! `axon-cli` – Axon operator console.
//!
//! ```text
//! axon [sim]              simulated sensor board + bridge server
//! axon serial [PORT]      real sensor board + bridge server
//! axon remote [HOST:PORT] face controller fed by a remote bridge
//! ```
//!
//! 1. Loads `~/.axon/config.toml` (written with defaults on first run).
//! 2. Starts the mode's pipeline and drops the operator into the REPL.
//! 3. Intercepts **Ctrl-C** to shut every component down in order.

mod config;
mod local;
mod remote;
mod repl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axon_hal::{SerialConfig, SerialLink, SimConfig, SimLink};
use axon_runtime::ControllerStatus;
use axon_runtime::telemetry::init_tracing;
use axon_types::{AxonError, CalibrationStatus, EmotionState};
use colored::Colorize;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Sim,
    Serial(Option<String>),
    Remote(Option<String>),
    Help,
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mode = match args.first().map(String::as_str) {
        None | Some("sim") => Mode::Sim,
        Some("serial") => Mode::Serial(args.get(1).cloned()),
        Some("remote") => Mode::Remote(args.get(1).cloned()),
        Some("help" | "-h" | "--help") => Mode::Help,
        Some(other) => return Err(format!("unknown mode '{other}'")),
    };
    let max_args = match mode {
        Mode::Serial(_) | Mode::Remote(_) => 2,
        Mode::Sim | Mode::Help => 1,
    };
    if args.len() > max_args {
        return Err(format!("unexpected argument '{}'", args[max_args]));
    }
    Ok(mode)
}

fn main() {
    let telemetry = init_tracing("axon", "info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(Mode::Help) => {
            print_usage();
            return;
        }
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{}: {e}", "Error".red());
            print_usage();
            drop(telemetry);
            std::process::exit(2);
        }
    };

    print_banner();
    let cfg = load_config();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; use /quit to exit");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("axon-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            drop(telemetry);
            std::process::exit(1);
        }
    };

    let result = match mode {
        Mode::Sim => local::run(
            &cfg,
            Box::new(SimLink::new(SimConfig::default())),
            &runtime,
            shutdown,
        ),
        Mode::Serial(port) => resolve_serial_port(port, &cfg).and_then(|path| {
            let link = SerialLink::new(SerialConfig::new(path).with_baud_rate(cfg.baud_rate));
            local::run(&cfg, Box::new(link), &runtime, shutdown)
        }),
        Mode::Remote(addr) => remote::run(
            addr.unwrap_or_else(|| cfg.remote_addr.clone()),
            &runtime,
            shutdown,
        ),
        Mode::Help => unreachable!("help is handled before startup"),
    };
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = result {
        error!(error = %e, "axon stopped with an error");
        eprintln!("{}: {e}", "Error".red());
        drop(telemetry);
        std::process::exit(1);
    }
}

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {e}", "Error saving config".red()),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {e}", "Config error".red());
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

/// Explicit argument, then the configured port, then the first port found.
fn resolve_serial_port(arg: Option<String>, cfg: &config::Config) -> Result<String, AxonError> {
    if let Some(port) = arg {
        return Ok(port);
    }
    if !cfg.serial_port.trim().is_empty() {
        return Ok(cfg.serial_port.trim().to_string());
    }
    SerialLink::available_ports().into_iter().next().ok_or_else(|| {
        AxonError::Config("no serial port found; pass one with `axon serial PORT`".to_string())
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared console output
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn print_status(status: &ControllerStatus) {
    println!("{}", "Calibration".bold().underline());
    let calibration = match status.calibration {
        CalibrationStatus::Calibrated => status.calibration.to_string().green(),
        CalibrationStatus::Uncalibrated => status.calibration.to_string().yellow(),
    };
    println!("  status      : {calibration}");
    if let Some(offsets) = status.offsets {
        println!(
            "  offsets     : x {:+.3}  y {:+.3}  z {:+.3} deg/s",
            offsets.x, offsets.y, offsets.z
        );
    }
    println!(
        "  samples {}  heartbeats {}  observer failures {}",
        status.samples, status.heartbeats, status.observer_failures
    );
}

pub(crate) fn print_face(state: &EmotionState) {
    println!("{}", "Face".bold().underline());
    println!(
        "  {:<10} yaw {:+6.1}°  pitch {:+6.1}°  roll {:+6.1}°",
        state.emotion.to_string().bold(),
        state.pose.yaw,
        state.pose.pitch,
        state.pose.roll
    );
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  axon [sim]               simulated sensor board + telemetry bridge");
    println!("  axon serial [PORT]       sensor board on PORT + telemetry bridge");
    println!("  axon remote [HOST:PORT]  face controller fed by a remote bridge");
}

fn print_banner() {
    println!();
    println!("{}", r#"    ___                    "#.bold().cyan());
    println!("{}", r#"   /   |  _  ______  ____  "#.bold().cyan());
    println!("{}", r#"  / /| | | |/_/ __ \/ __ \ "#.bold().cyan());
    println!("{}", r#" / ___ |_>  </ /_/ / / / / "#.bold().cyan());
    println!("{}", r#"/_/  |_/_/|_|\____/_/ /_/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Axon".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Sensor telemetry and expressive face controller");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_mode_is_sim() {
        assert_eq!(parse_args(&[]), Ok(Mode::Sim));
        assert_eq!(parse_args(&args(&["sim"])), Ok(Mode::Sim));
    }

    #[test]
    fn serial_and_remote_take_an_optional_target() {
        assert_eq!(parse_args(&args(&["serial"])), Ok(Mode::Serial(None)));
        assert_eq!(
            parse_args(&args(&["serial", "/dev/ttyUSB0"])),
            Ok(Mode::Serial(Some("/dev/ttyUSB0".to_string())))
        );
        assert_eq!(
            parse_args(&args(&["remote", "robot:8765"])),
            Ok(Mode::Remote(Some("robot:8765".to_string())))
        );
    }

    #[test]
    fn unknown_modes_and_extra_arguments_are_rejected() {
        assert!(parse_args(&args(&["fly"])).is_err());
        assert!(parse_args(&args(&["sim", "extra"])).is_err());
        assert!(parse_args(&args(&["remote", "a:1", "b:2"])).is_err());
    }

    #[test]
    fn explicit_serial_port_wins_over_config() {
        let mut cfg = config::Config::default();
        cfg.serial_port = "/dev/ttyACM0".to_string();
        assert_eq!(
            resolve_serial_port(Some("/dev/ttyUSB1".to_string()), &cfg).unwrap(),
            "/dev/ttyUSB1"
        );
        assert_eq!(resolve_serial_port(None, &cfg).unwrap(), "/dev/ttyACM0");
    }
}
