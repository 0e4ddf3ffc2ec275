//! Process backend: each worker is a child process.
//!
//! The worker program is re-executed with `WORKER_FARM_CHILD=1` and talks the
//! line protocol over its stdin/stdout. Per worker, two I/O threads run:
//!
//! - a writer draining an unbounded queue into the child's stdin, so a hung
//!   worker can never block the controller;
//! - a reader parsing the child's stdout into [`WorkerEvent`]s and, at EOF,
//!   reaping the child and reporting how it terminated.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{ControlMessage, WorkerId, WorkerMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use super::{Spawned, Spawner, WorkerEvent, WorkerHandle, WorkerInfo};
use crate::child::CHILD_ENV;
use crate::config::WorkerOptions;
use crate::error::{FarmError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// How often an exiting child is polled once its stdout has closed.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Spawns worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    options: WorkerOptions,
}

impl ProcessSpawner {
    pub fn new(options: &WorkerOptions) -> Result<Self> {
        let program = match &options.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                FarmError::WorkerInit(format!("Failed to get current executable: {}", e))
            })?,
        };
        Ok(Self {
            program,
            options: options.clone(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.options.args);
        cmd.envs(self.options.env.iter().map(|(k, v)| (k, v)));
        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env(CHILD_ENV, "1");

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker logs go to the parent's stderr
        cmd
    }
}

impl Spawner for ProcessSpawner {
    fn launch(&self, id: WorkerId) -> Result<Spawned> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| FarmError::WorkerInit(format!("Failed to spawn worker: {}", e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let reaper = Arc::new(Reaper::new(child));

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            reaper.kill_now();
            return Err(FarmError::WorkerInit("Child stdio not captured".into()));
        };

        let (outbound_tx, outbound_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();

        if let Err(e) = spawn_io_threads(id, stdin, stdout, outbound_rx, events_tx, &reaper) {
            reaper.kill_now();
            return Err(FarmError::WorkerInit(format!(
                "Failed to spawn worker I/O thread: {}",
                e
            )));
        }

        tracing::debug!(worker_id = id, pid, "Spawned worker process");

        Ok(Spawned {
            handle: Box::new(ProcessHandle {
                id,
                outbound: outbound_tx,
                reaper,
            }),
            events: events_rx,
            info: WorkerInfo {
                id,
                pid: Some(pid),
                thread_name: None,
            },
        })
    }
}

fn spawn_io_threads(
    id: WorkerId,
    stdin: ChildStdin,
    stdout: ChildStdout,
    outbound: Receiver<ControlMessage>,
    events: Sender<WorkerEvent>,
    reaper: &Arc<Reaper>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("farm-worker-{}-writer", id))
        .spawn(move || write_loop(id, LineWriter::new(PipeFd::from(stdin)), outbound))?;

    let reaper = Arc::clone(reaper);
    thread::Builder::new()
        .name(format!("farm-worker-{}-reader", id))
        .spawn(move || {
            read_loop(id, LineReader::new(PipeFd::from(stdout)), &events);
            let reason = reaper.reap();
            tracing::debug!(worker_id = id, %reason, "Worker process exited");
            // The controller may already have dropped this worker
            let _ = events.send(WorkerEvent::Exited(reason));
        })?;

    Ok(())
}

fn write_loop(id: WorkerId, mut writer: LineWriter, outbound: Receiver<ControlMessage>) {
    for message in outbound {
        tracing::trace!(worker_id = id, ?message, "-> worker");
        if let Err(e) = writer.write_line(&message.to_line()) {
            tracing::debug!(worker_id = id, error = %e, "Worker stdin closed");
            return;
        }
    }
    // Queue closed: dropping the writer closes the child's stdin
}

fn read_loop(id: WorkerId, mut reader: LineReader, events: &Sender<WorkerEvent>) {
    loop {
        match reader.read_line() {
            Ok(Some(line)) => match WorkerMessage::from_line(line) {
                Some(message) => {
                    tracing::trace!(worker_id = id, ?message, "<- worker");
                    // Keep draining even if nobody listens, so the child never
                    // blocks on a full stdout pipe
                    let _ = events.send(WorkerEvent::Message(message));
                }
                None => {
                    tracing::trace!(worker_id = id, line, "Ignoring non-farm output");
                }
            },
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(worker_id = id, error = %e, "Failed to read from worker");
                return;
            }
        }
    }
}

/// Send side of a worker process.
struct ProcessHandle {
    id: WorkerId,
    outbound: Sender<ControlMessage>,
    reaper: Arc<Reaper>,
}

impl WorkerHandle for ProcessHandle {
    fn send(&self, message: ControlMessage) -> Result<()> {
        self.outbound.send(message).map_err(|_| {
            FarmError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("worker {} is no longer reading", self.id),
            ))
        })
    }

    fn stop_with_timeout(self: Box<Self>, grace: Duration) {
        let ProcessHandle {
            id,
            outbound,
            reaper,
        } = *self;

        let _ = outbound.send(ControlMessage::Die);
        drop(outbound);

        let spawned = thread::Builder::new()
            .name(format!("farm-worker-{}-stopper", id))
            .spawn(move || {
                if reaper.kill_after(grace) {
                    tracing::warn!(
                        worker_id = id,
                        grace_ms = grace.as_millis() as u64,
                        "Worker did not exit in time, sent SIGKILL"
                    );
                }
            });
        if let Err(e) = spawned {
            tracing::error!(worker_id = id, error = %e, "Failed to spawn stopper thread");
        }
    }
}

struct ReapState {
    child: Child,
    reaped: bool,
}

/// Owns the child for reaping and killing.
///
/// Kills only happen under the state lock while the child is known to be
/// unreaped, so a signal can never hit a recycled pid.
struct Reaper {
    pid: Pid,
    state: Mutex<ReapState>,
    exited: Condvar,
}

impl Reaper {
    fn new(child: Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            state: Mutex::new(ReapState {
                child,
                reaped: false,
            }),
            exited: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the child to exit and report why.
    fn reap(&self) -> TerminationReason {
        let mut state = self.lock();
        loop {
            match state.child.try_wait() {
                Ok(Some(status)) => {
                    state.reaped = true;
                    self.exited.notify_all();
                    return analyze_exit_status(status);
                }
                Ok(None) => {
                    state = match self.exited.wait_timeout(state, REAP_POLL_INTERVAL) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                Err(e) => {
                    tracing::warn!(pid = self.pid.as_raw(), error = %e, "Failed to reap worker");
                    state.reaped = true;
                    self.exited.notify_all();
                    return TerminationReason::Unknown;
                }
            }
        }
    }

    /// Wait up to `grace` for the child to be reaped, then SIGKILL it.
    /// Returns whether a kill was sent.
    fn kill_after(&self, grace: Duration) -> bool {
        let state = self.lock();
        let state = match self
            .exited
            .wait_timeout_while(state, grace, |state| !state.reaped)
        {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
        if state.reaped {
            return false;
        }
        self.kill_locked()
    }

    /// Kill and reap a child that never made it into service.
    fn kill_now(&self) {
        {
            let state = self.lock();
            if state.reaped {
                return;
            }
            self.kill_locked();
        }
        self.reap();
    }

    fn kill_locked(&self) -> bool {
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid = self.pid.as_raw(), error = %e, "Failed to send SIGKILL");
                false
            }
        }
    }
}
