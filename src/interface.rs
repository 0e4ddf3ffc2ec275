//! Public interface to a farm.
//!
//! [`create_farm`] starts a farm and returns [`Workers`], from which calls
//! are made either on the module's default export ([`Workers::call`]) or on
//! named exports ([`Workers::method`]).
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use worker_farm::{FarmConfig, create_farm, shutdown};
//!
//! let workers = create_farm(FarmConfig::default(), "math", Some(&["double"]))?;
//! let double = workers.method("double").expect("listed above");
//!
//! double.call(vec![json!(21)], |result| match result {
//!     Ok(values) => println!("got {:?}", values),
//!     Err(e) => eprintln!("{}: {}", e.kind(), e),
//! });
//!
//! let answer = double.invoke(vec![json!(4)]).wait()?;
//! assert_eq!(answer, vec![json!(8)]);
//!
//! shutdown(&workers, Some(Box::new(|| println!("farm stopped"))));
//! # Ok::<(), worker_farm::FarmError>(())
//! ```

use crate::config::FarmConfig;
use crate::error::{FarmError, Result};
use crate::farm::{Call, CallResult, Callback, FarmHandle, QueueInfo, ShutdownCallback};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-call options.
pub struct CallOptions {
    pub callback: Callback,
    /// Overrides the farm's `max_call_time` for this call.
    pub max_call_time: Option<Duration>,
}

impl CallOptions {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            max_call_time: None,
        }
    }

    pub fn with_max_call_time(mut self, max_call_time: Duration) -> Self {
        self.max_call_time = Some(max_call_time);
        self
    }
}

/// A callable export of the farm's module.
#[derive(Clone)]
pub struct Method {
    farm: Arc<FarmHandle>,
    name: Option<String>,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish()
    }
}

impl Method {
    /// Export name; `None` for the default export.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Call the export. `callback` runs exactly once, on the farm's callback
    /// thread, or right away on this thread if the call is not admitted.
    pub fn call<F>(&self, args: Vec<Value>, callback: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.call_with(args, CallOptions::new(callback));
    }

    pub fn call_with(&self, args: Vec<Value>, options: CallOptions) {
        let mut call = Call::new(self.name.clone(), args, options.callback);
        call.max_call_time = options.max_call_time;
        self.farm.add_call(call);
    }

    /// Call the export and get a handle to block on for the result.
    pub fn invoke(&self, args: Vec<Value>) -> PendingCall {
        let (tx, rx) = bounded(1);
        self.call(args, move |result| {
            let _ = tx.send(result);
        });
        PendingCall { result: rx }
    }
}

/// Result of [`Method::invoke`], not yet received.
#[derive(Debug)]
pub struct PendingCall {
    result: Receiver<CallResult>,
}

impl PendingCall {
    /// Block until the call completes.
    pub fn wait(self) -> CallResult {
        self.result.recv().unwrap_or(Err(FarmError::ShuttingDown))
    }

    /// Block up to `timeout`. `None` if the call is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CallResult> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(FarmError::ShuttingDown)),
        }
    }
}

/// Handle to a running farm.
///
/// Cheap to clone; the farm shuts down silently once every clone (and every
/// [`Method`] taken from it) has been dropped.
#[derive(Clone)]
pub struct Workers {
    farm: Arc<FarmHandle>,
    methods: BTreeMap<String, Method>,
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Workers {
    /// The module's default export.
    pub fn default_method(&self) -> Method {
        Method {
            farm: Arc::clone(&self.farm),
            name: None,
        }
    }

    /// Call the module's default export.
    pub fn call<F>(&self, args: Vec<Value>, callback: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.default_method().call(args, callback);
    }

    pub fn call_with(&self, args: Vec<Value>, options: CallOptions) {
        self.default_method().call_with(args, options);
    }

    pub fn invoke(&self, args: Vec<Value>) -> PendingCall {
        self.default_method().invoke(args)
    }

    /// A named export listed when the farm was created.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Names of the listed exports.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Shut down once in-flight calls complete. New calls are rejected.
    pub fn shutdown(&self) {
        self.farm.end(None);
    }

    /// Like [`Workers::shutdown`], running `callback` once every worker has
    /// stopped and every pending continuation has run.
    pub fn shutdown_with<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.farm.end(Some(Box::new(callback)));
    }

    /// Current load of the farm.
    pub fn queue(&self) -> QueueInfo {
        self.farm.queue_info()
    }
}

/// Start a farm serving `module`.
///
/// With `methods` the returned [`Workers`] exposes each listed export through
/// [`Workers::method`]; the default export is always reachable through
/// [`Workers::call`].
pub fn create_farm(config: FarmConfig, module: &str, methods: Option<&[&str]>) -> Result<Workers> {
    let farm = Arc::new(FarmHandle::launch(config, module.to_string())?);

    let methods = methods
        .unwrap_or_default()
        .iter()
        .map(|name| {
            let method = Method {
                farm: Arc::clone(&farm),
                name: Some(name.to_string()),
            };
            (name.to_string(), method)
        })
        .collect();

    Ok(Workers { farm, methods })
}

/// Shut a farm down, optionally notifying `callback` when it has stopped.
pub fn shutdown(workers: &Workers, callback: Option<ShutdownCallback>) {
    workers.farm.end(callback);
}

/// Current load of a farm; empty when there is none.
pub fn introspect(workers: Option<&Workers>) -> QueueInfo {
    workers.map(Workers::queue).unwrap_or_default()
}
