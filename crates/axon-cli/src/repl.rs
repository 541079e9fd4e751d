//! REPL – the operator console shared by every mode.
//!
//! Supported slash-commands:
//!   /help         – show this list
//!   /status       – link, calibration and face status
//!   /clients      – connected bridge clients
//!   /recalibrate  – clear the gyro offsets and start a new rest window
//!   /reconnect    – drop the link and connect again
//!   /quit | /exit – gracefully exit the CLI
//!
//! Any other line is sent to the robot as a command.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use colored::Colorize;

/// How often the REPL checks the shutdown flag while waiting for input.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Help,
    Status,
    Clients,
    Recalibrate,
    Reconnect,
    Quit,
    Command(String),
    Unknown(String),
}

/// Classify one input line; blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Action> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(match line {
        "/help" | "/?" => Action::Help,
        "/status" => Action::Status,
        "/clients" => Action::Clients,
        "/recalibrate" => Action::Recalibrate,
        "/reconnect" => Action::Reconnect,
        "/quit" | "/exit" => Action::Quit,
        other if other.starts_with('/') => Action::Unknown(other.to_string()),
        other => Action::Command(other.to_string()),
    })
}

/// What a running mode offers to the operator.
pub trait Console {
    fn status(&self);
    fn clients(&self);
    fn recalibrate(&self);
    fn reconnect(&self);
    fn send(&self, text: &str);
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled while waiting for input; when set (by `/quit` or the
/// Ctrl-C handler) the REPL returns.  End of input also ends the REPL.
pub fn run(console: &dyn Console, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let lines = spawn_stdin_reader()?;
    prompt();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let line = match lines.recv_timeout(SHUTDOWN_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match parse_line(&line) {
            None => {}
            Some(Action::Help) => cmd_help(),
            Some(Action::Status) => console.status(),
            Some(Action::Clients) => console.clients(),
            Some(Action::Recalibrate) => console.recalibrate(),
            Some(Action::Reconnect) => console.reconnect(),
            Some(Action::Command(text)) => console.send(&text),
            Some(Action::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Some(Action::Unknown(other)) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    print!("{} ", "axon>".bold().cyan());
    io::stdout().flush().ok();
}

/// Stdin blocks, so it is read on its own thread and handed over line by
/// line.  The channel disconnects at end of input.
fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("axon-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Axon Commands".bold().underline());
    println!("  {}       – link, calibration and face status", "/status".bold().cyan());
    println!("  {}      – connected bridge clients", "/clients".bold().cyan());
    println!("  {}  – start a new gyro calibration", "/recalibrate".bold().cyan());
    println!("  {}    – drop the link and connect again", "/reconnect".bold().cyan());
    println!("  {}  – exit the CLI", "/quit  /exit".bold().cyan());
    println!("  Anything else is sent to the robot, e.g. {}", "LED ON".bold());
    println!();
}
