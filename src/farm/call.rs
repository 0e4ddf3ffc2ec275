//! Calls and the executor their continuations run on.

use super::timer::TimerId;
use crate::error::FarmError;
use crossbeam_channel::{Sender, unbounded};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcome of a call: the results the worker sent, or why it failed.
pub type CallResult = std::result::Result<Vec<Value>, FarmError>;

/// Continuation of a call. Invoked exactly once.
pub type Callback = Box<dyn FnOnce(CallResult) + Send>;

/// Invoked once the farm has shut down.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// One logical call, from invocation until its continuation fires.
pub struct Call {
    /// Export to invoke; `None` is the default export.
    pub method: Option<String>,
    pub args: Vec<Value>,
    pub callback: Callback,
    /// Overrides the farm's max call time for this call.
    pub max_call_time: Option<Duration>,
    /// Times this call was requeued after its worker died.
    pub retries: u32,
    pub timer: Option<TimerId>,
}

impl Call {
    pub fn new(method: Option<String>, args: Vec<Value>, callback: Callback) -> Self {
        Self {
            method,
            args,
            callback,
            max_call_time: None,
            retries: 0,
            timer: None,
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("retries", &self.retries)
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Runs continuations and shutdown callbacks on a dedicated thread, in the
/// order they were handed over.
pub struct CallbackExecutor {
    jobs: Sender<Job>,
}

impl CallbackExecutor {
    pub fn spawn(name: &str) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (jobs, rx) = unbounded::<Job>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in rx {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Farm callback panicked");
                }
            }
        })?;
        Ok((Self { jobs }, handle))
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.jobs.send(Box::new(job)) {
            // Executor thread is gone; run inline rather than lose the callback
            tracing::warn!("Callback executor stopped, running callback inline");
            (e.into_inner())();
        }
    }

    /// Hand a call's outcome to its continuation.
    pub fn complete(&self, callback: Callback, result: CallResult) {
        self.execute(move || callback(result));
    }
}
