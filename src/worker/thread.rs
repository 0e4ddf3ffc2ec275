//! Thread backend: each worker is a named thread of this process.
//!
//! The thread runs the same worker-side adapter as a worker process, over
//! in-memory channels instead of pipes. Threads cannot be killed; one that
//! ignores the die message is abandoned after the grace period.

use super::protocol::{ControlMessage, WorkerId, WorkerMessage};
use super::signals::TerminationReason;
use super::{Spawned, Spawner, WorkerEvent, WorkerHandle, WorkerInfo};
use crate::child::{ModuleRegistry, Outbound, serve};
use crate::config::WorkerOptions;
use crate::error::{FarmError, Result};
use crossbeam_channel::{Sender, unbounded};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Spawns worker threads serving modules from a registry.
#[derive(Debug, Clone)]
pub struct ThreadSpawner {
    registry: Arc<ModuleRegistry>,
    name_prefix: String,
    stack_size: Option<usize>,
}

impl ThreadSpawner {
    pub fn new(registry: Arc<ModuleRegistry>, options: &WorkerOptions) -> Self {
        Self {
            registry,
            name_prefix: options.thread_name_prefix.clone(),
            stack_size: options.stack_size,
        }
    }
}

impl Spawner for ThreadSpawner {
    fn launch(&self, id: WorkerId) -> Result<Spawned> {
        let name = format!("{}-{}", self.name_prefix, id);
        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let exited = Arc::new(ExitFlag::default());

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let registry = Arc::clone(&self.registry);
        let guard_flag = Arc::clone(&exited);
        builder
            .spawn(move || {
                let mut guard = ExitGuard {
                    events: events_tx.clone(),
                    exited: guard_flag,
                    code: 0,
                };
                let out = Arc::new(ChannelOutbound { events: events_tx });
                guard.code = serve(control_rx, out, &registry).exit_code();
            })
            .map_err(|e| FarmError::WorkerInit(format!("Failed to spawn worker thread: {}", e)))?;

        tracing::debug!(worker_id = id, thread = %name, "Spawned worker thread");

        Ok(Spawned {
            handle: Box::new(ThreadHandle {
                id,
                control: control_tx,
                exited,
            }),
            events: events_rx,
            info: WorkerInfo {
                id,
                pid: None,
                thread_name: Some(name),
            },
        })
    }
}

struct ChannelOutbound {
    events: Sender<WorkerEvent>,
}

impl Outbound for ChannelOutbound {
    fn send(&self, message: WorkerMessage) {
        // Controller may already have dropped this worker
        let _ = self.events.send(WorkerEvent::Message(message));
    }

    fn abort(&self) {
        // The thread itself may live on; the farm stops trusting it
        let _ = self
            .events
            .send(WorkerEvent::Exited(TerminationReason::Panicked));
    }
}

#[derive(Default)]
struct ExitFlag {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ExitFlag {
    fn set(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the flag. Returns whether it was set.
    fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        match self.cond.wait_timeout_while(done, timeout, |done| !*done) {
            Ok((done, _)) => *done,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// Reports the thread's end, including by panic.
struct ExitGuard {
    events: Sender<WorkerEvent>,
    exited: Arc<ExitFlag>,
    code: i32,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = if thread::panicking() {
            TerminationReason::Panicked
        } else {
            TerminationReason::Exited(self.code)
        };
        self.exited.set();
        let _ = self.events.send(WorkerEvent::Exited(reason));
    }
}

struct ThreadHandle {
    id: WorkerId,
    control: Sender<ControlMessage>,
    exited: Arc<ExitFlag>,
}

impl WorkerHandle for ThreadHandle {
    fn send(&self, message: ControlMessage) -> Result<()> {
        self.control.send(message).map_err(|_| {
            FarmError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("worker thread {} has exited", self.id),
            ))
        })
    }

    fn stop_with_timeout(self: Box<Self>, grace: Duration) {
        let ThreadHandle {
            id,
            control,
            exited,
        } = *self;

        let _ = control.send(ControlMessage::Die);
        drop(control);

        let spawned = thread::Builder::new()
            .name(format!("farm-worker-{}-stopper", id))
            .spawn(move || {
                if !exited.wait(grace) {
                    tracing::warn!(
                        worker_id = id,
                        grace_ms = grace.as_millis() as u64,
                        "Worker thread did not exit in time, abandoning it"
                    );
                }
            });
        if let Err(e) = spawned {
            tracing::error!(worker_id = id, error = %e, "Failed to spawn stopper thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::Module;
    use crate::worker::InitOptions;
    use crate::worker::protocol::decode_outcome;
    use serde_json::json;

    fn spawner() -> ThreadSpawner {
        let mut registry = ModuleRegistry::new();
        registry.register("echo", |ctx| {
            ctx.ready_signal().signal();
            Ok(Module::new()
                .with_default(|args, done| done.ok(args))
                .export("panic", |_args, _done| panic!("worker blew up"))
                .export("panic-later", |_args, done| {
                    thread::spawn(move || {
                        let _held = done;
                        panic!("helper blew up");
                    });
                }))
        });
        ThreadSpawner::new(Arc::new(registry), &WorkerOptions::default())
    }

    fn init(async_init: bool) -> InitOptions {
        InitOptions {
            async_init,
            max_init_time: Some(Duration::from_secs(5)),
            forced_kill_time: Duration::from_millis(100),
        }
    }

    fn recv(spawned: &Spawned) -> WorkerEvent {
        spawned
            .events
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_call_round_trip() {
        let spawned = spawner().start(1, "echo", &init(true)).unwrap();
        assert_eq!(spawned.info.thread_name.as_deref(), Some("farm-worker-1"));
        assert_eq!(spawned.info.pid, None);

        spawned
            .handle
            .send(ControlMessage::call(0, 1, None, vec![json!("hi")]))
            .unwrap();
        let WorkerEvent::Message(WorkerMessage::Result { idx, args, .. }) = recv(&spawned) else {
            panic!("Expected a result");
        };
        assert_eq!(idx, 0);
        assert_eq!(decode_outcome(args).unwrap(), vec![json!("hi")]);

        let Spawned { handle, events, .. } = spawned;
        handle.stop_with_timeout(Duration::from_secs(1));
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerEvent::Exited(TerminationReason::Exited(0))
        );
    }

    #[test]
    fn test_panic_on_helper_thread_reports_exit() {
        let spawned = spawner().start(4, "echo", &init(true)).unwrap();
        spawned
            .handle
            .send(ControlMessage::call(0, 4, Some("panic-later".into()), vec![]))
            .unwrap();
        assert_eq!(
            recv(&spawned),
            WorkerEvent::Exited(TerminationReason::Panicked)
        );
        spawned.handle.send(ControlMessage::Die).unwrap();
    }

    #[test]
    fn test_panic_reports_exit() {
        let spawned = spawner().start(2, "echo", &init(false)).unwrap();
        spawned
            .handle
            .send(ControlMessage::call(0, 2, Some("panic".into()), vec![]))
            .unwrap();
        loop {
            match recv(&spawned) {
                WorkerEvent::Exited(reason) => {
                    assert_eq!(reason, TerminationReason::Panicked);
                    break;
                }
                WorkerEvent::Message(WorkerMessage::Ready) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_module_fails_init() {
        let err = spawner().start(3, "missing", &init(true)).unwrap_err();
        assert_eq!(err.to_string(), "worker exited during initialisation");
    }
}
