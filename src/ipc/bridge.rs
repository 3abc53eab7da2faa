//! IPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking reader thread sends deserialized commands through an mpsc
//! channel; events are written to stdout as JSON lines.

use std::io::{self, BufRead, BufReader, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{ViewerCommand, ViewerEvent};

/// Write `event` as one JSON line to `out` and flush.
pub fn write_event<W: Write>(out: &mut W, event: &ViewerEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{}", json)?;
    out.flush()
}

/// Emit a `ViewerEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &ViewerEvent) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Ignore write/flush errors, the pipe may be closed.
    if let Err(e) = write_event(&mut handle, event) {
        if e.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("Failed to emit event: {}", e);
        }
    }
}

/// Convenience helper for emitting error events not tied to a viewer.
pub fn emit_error(message: &str) {
    emit_event(&ViewerEvent::Error {
        id: None,
        kind: None,
        message: message.to_string(),
    });
}

/// Parse one input line into a command.
pub fn parse_command(line: &str) -> Result<ViewerCommand, serde_json::Error> {
    serde_json::from_str(line)
}

/// Spawn a blocking thread that reads JSON lines from `reader` and forwards
/// parsed commands through the returned channel. Invalid lines are reported
/// as error events and skipped.
///
/// The thread exits at end of input or when the receiver is dropped.
pub fn spawn_reader<R>(reader: R) -> mpsc::UnboundedReceiver<ViewerCommand>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_command(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received command");
                            if tx.send(cmd).is_err() {
                                break; // Receiver dropped, main task is gone.
                            }
                        }
                        Err(e) => {
                            error!("Invalid JSON command: {}", e);
                            emit_error(&format!("Invalid JSON command: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

/// [`spawn_reader`] over the process stdin.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<ViewerCommand> {
    spawn_reader(BufReader::new(io::stdin()))
}
