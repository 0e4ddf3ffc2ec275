//! Worker process entry point.
//!
//! A worker program is any binary that calls [`run_if_worker`] early in
//! `main`. When the farm spawns it, `WORKER_FARM_CHILD` is set and the call
//! never returns: the process serves control messages from stdin, writes
//! responses to stdout and exits. A panic on any thread of a worker
//! process exits it with [`PANIC_EXIT_CODE`].

use super::{ModuleRegistry, Outbound, serve};
use crate::worker::ipc::{LineReader, LineWriter, PipeFd};
use crate::worker::protocol::{ControlMessage, WorkerMessage};
use std::sync::{Arc, Mutex, PoisonError};

/// Environment marker set on every worker process.
pub const CHILD_ENV: &str = "WORKER_FARM_CHILD";

/// Exit code of a worker process taken down by a panic.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Responses may be sent from any thread a module answers on.
struct StdoutOutbound {
    writer: Mutex<LineWriter>,
}

impl Outbound for StdoutOutbound {
    fn send(&self, message: WorkerMessage) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_line(&message.to_line()) {
            // Controller is gone; nothing left to answer to
            tracing::debug!(error = %e, "Failed to write response");
        }
    }

    fn abort(&self) {
        std::process::exit(PANIC_EXIT_CODE);
    }
}

/// Exit the process on any panic, on whichever thread it happens, so calls
/// in flight go down the farm's crash path instead of hanging.
fn exit_on_panic() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(PANIC_EXIT_CODE);
    }));
}

/// Serve as a worker if this process was spawned by a farm.
///
/// Returns immediately in any other process.
pub fn run_if_worker(registry: &ModuleRegistry) {
    if std::env::var_os(CHILD_ENV).is_some() {
        std::process::exit(run_worker_main(registry));
    }
}

/// Run the worker loop on this process's stdin/stdout.
///
/// Returns the exit code the process should use.
pub fn run_worker_main(registry: &ModuleRegistry) -> i32 {
    // Ignore SIGPIPE - a vanished controller surfaces as a write error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }
    exit_on_panic();

    let (stdin_fd, stdout_fd) = match (PipeFd::stdin(), PipeFd::stdout()) {
        (Ok(stdin), Ok(stdout)) => (stdin, stdout),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to open worker stdio");
            return 1;
        }
    };

    let mut reader = LineReader::new(stdin_fd);
    let out = Arc::new(StdoutOutbound {
        writer: Mutex::new(LineWriter::new(stdout_fd)),
    });

    let incoming = std::iter::from_fn(|| {
        loop {
            match reader.read_line() {
                Ok(Some(line)) => match ControlMessage::from_line(line) {
                    Some(message) => return Some(message),
                    None => tracing::warn!(line, "Ignoring unrecognised control line"),
                },
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read control message");
                    return None;
                }
            }
        }
    });

    let exit = serve(incoming, out, registry);
    tracing::debug!(?exit, "Worker exiting");
    exit.exit_code()
}
