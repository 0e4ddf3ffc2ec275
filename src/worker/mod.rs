//! Worker spawning for the farm.
//!
//! A worker is either a child process re-executing a worker program or a
//! thread of the current process. Both are driven through the same contract:
//!
//! ```text
//!   controller ──ControlMessage──▶ WorkerHandle ──▶ worker
//!   controller ◀──WorkerEvent──── events rx    ◀── worker
//! ```
//!
//! [`Spawner::launch`] brings a worker up; [`Spawner::start`] additionally
//! sends the load message and, with async init, waits for the ready signal.

pub mod ipc;
pub mod process;
pub mod protocol;
pub mod signals;
pub mod thread;

use crate::error::{FarmError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use protocol::{ControlMessage, WorkerId, WorkerMessage};
use signals::TerminationReason;
use std::time::{Duration, Instant};

pub use process::ProcessSpawner;
pub use thread::ThreadSpawner;

/// Startup options shared by every worker of a farm.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Wait for the worker's ready signal before reporting it started.
    pub async_init: bool,
    /// Deadline for the ready signal. `None` waits indefinitely.
    pub max_init_time: Option<Duration>,
    /// Grace period before a stopping worker is force-terminated.
    pub forced_kill_time: Duration,
}

/// Identity of a started worker, as passed to the worker-started hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// OS process id (process backend).
    pub pid: Option<u32>,
    /// Thread name (thread backend).
    pub thread_name: Option<String>,
}

/// Something a worker reported.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// The worker is gone. Always the last event of a worker.
    Exited(TerminationReason),
}

/// Send side of a running worker.
pub trait WorkerHandle: Send {
    /// Queue a message for the worker. Never blocks on the worker itself.
    fn send(&self, message: ControlMessage) -> Result<()>;

    /// Ask the worker to exit, force-terminating it if it has not exited
    /// within `grace`. Returns immediately.
    fn stop_with_timeout(self: Box<Self>, grace: Duration);
}

/// A launched worker: its handle, event stream and identity.
pub struct Spawned {
    pub handle: Box<dyn WorkerHandle>,
    pub events: Receiver<WorkerEvent>,
    pub info: WorkerInfo,
}

impl std::fmt::Debug for Spawned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawned").field("info", &self.info).finish()
    }
}

/// Starts workers of one kind.
pub trait Spawner: Send + Sync {
    /// Bring up a worker without loading anything into it.
    fn launch(&self, id: WorkerId) -> Result<Spawned>;

    /// Launch a worker, load `module` into it and perform the async-init
    /// handshake when requested.
    fn start(&self, id: WorkerId, module: &str, init: &InitOptions) -> Result<Spawned> {
        let spawned = self.launch(id)?;

        let loaded = spawned.handle.send(ControlMessage::Load {
            module: module.to_string(),
        });
        let outcome = match loaded {
            Ok(()) if init.async_init => wait_for_ready(&spawned.events, init.max_init_time),
            Ok(()) => Ok(()),
            Err(e) => Err(FarmError::WorkerInit(format!(
                "failed to send load message: {}",
                e
            ))),
        };

        match outcome {
            Ok(()) => Ok(spawned),
            Err(e) => {
                tracing::debug!(worker_id = id, error = %e, "Worker failed to initialise");
                spawned.handle.stop_with_timeout(init.forced_kill_time);
                Err(e)
            }
        }
    }
}

/// Wait for the ready message on a worker's event stream.
fn wait_for_ready(events: &Receiver<WorkerEvent>, max_init_time: Option<Duration>) -> Result<()> {
    let deadline = max_init_time.map(|d| Instant::now() + d);

    loop {
        let event = match deadline {
            Some(deadline) => events.recv_deadline(deadline),
            None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match event {
            Ok(WorkerEvent::Message(WorkerMessage::Ready)) => return Ok(()),
            Ok(WorkerEvent::Message(other)) => {
                tracing::trace!(?other, "Ignoring message before ready signal");
            }
            Ok(WorkerEvent::Exited(_)) | Err(RecvTimeoutError::Disconnected) => {
                return Err(FarmError::WorkerInit(
                    "worker exited during initialisation".into(),
                ));
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(FarmError::WorkerInit("worker init timed out".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_ready_after_other_messages() {
        let (tx, rx) = unbounded();
        tx.send(WorkerEvent::Message(WorkerMessage::result(0, 1, Ok(vec![]))))
            .unwrap();
        tx.send(WorkerEvent::Message(WorkerMessage::Ready)).unwrap();
        assert!(wait_for_ready(&rx, Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn test_exit_before_ready() {
        let (tx, rx) = unbounded();
        tx.send(WorkerEvent::Exited(TerminationReason::Exited(1)))
            .unwrap();
        let err = wait_for_ready(&rx, None).unwrap_err();
        assert_eq!(err.kind(), "WorkerInitError");
        assert_eq!(err.to_string(), "worker exited during initialisation");
    }

    #[test]
    fn test_disconnected_counts_as_exit() {
        let (tx, rx) = unbounded::<WorkerEvent>();
        drop(tx);
        let err = wait_for_ready(&rx, Some(Duration::from_secs(1))).unwrap_err();
        assert_eq!(err.to_string(), "worker exited during initialisation");
    }

    #[test]
    fn test_init_deadline() {
        let (_tx, rx) = unbounded::<WorkerEvent>();
        let started = Instant::now();
        let err = wait_for_ready(&rx, Some(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err.to_string(), "worker init timed out");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
