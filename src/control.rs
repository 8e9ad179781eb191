//! Operator command surface.
//!
//! Lines come from stdin through a dedicated OS thread so the runtime never
//! blocks on terminal input.

use std::io::{BufRead, Write};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const HELP_TEXT: &str = "Commands:\n  help  show this message\n  exit  flush pending changes and stop the monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Command::Empty,
            "exit" => Command::Exit,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// Why the control loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    ExitCommand,
    InputClosed,
}

/// Read commands until `exit` or end of input.
pub async fn run_control_loop<W: Write>(
    mut lines: mpsc::Receiver<String>,
    out: &mut W,
) -> ControlExit {
    while let Some(line) = lines.recv().await {
        match Command::parse(&line) {
            Command::Exit => return ControlExit::ExitCommand,
            Command::Help => {
                let _ = writeln!(out, "{}", HELP_TEXT);
            }
            Command::Empty => {}
            Command::Unknown(cmd) => {
                let _ = writeln!(out, "Unknown command: {} (type 'help')", cmd);
            }
        }
        let _ = out.flush();
    }
    ControlExit::InputClosed
}

/// Forward stdin lines into a channel from a background thread.
///
/// The channel closes on EOF or read error.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("stdin-control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            debug!("stdin reader finished");
        });
    if let Err(e) = spawned {
        // Sender was moved into the failed closure and dropped: input reads as closed.
        warn!(error = %e, "failed to spawn stdin reader");
    }
    rx
}
