//! Worker-side adapter.
//!
//! Runs inside every worker (process or thread). It loads the requested
//! module from a [`ModuleRegistry`] on the first load message, resolves each
//! call to an exported function and hands the function a [`Completion`]
//! through which exactly one response is sent back.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use worker_farm::child::{Module, ModuleRegistry, run_if_worker};
//!
//! let mut registry = ModuleRegistry::new();
//! registry.register("math", |_ctx| {
//!     Ok(Module::new().export("double", |args, done| {
//!         let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
//!         done.ok(vec![json!(n * 2)]);
//!     }))
//! });
//!
//! // In a worker process this serves calls and exits; otherwise it returns.
//! run_if_worker(&registry);
//! ```

mod worker_main;

pub use worker_main::{CHILD_ENV, PANIC_EXIT_CODE, run_if_worker, run_worker_main};

use crate::error::RemoteErrorKind;
use crate::worker::protocol::{ControlMessage, WireError, WorkerId, WorkerMessage};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// An exported function. Receives the call arguments and the completion to
/// answer through; it may answer later from another thread.
pub type ExportFn = Arc<dyn Fn(Vec<Value>, Completion) + Send + Sync>;

/// Builds a module when a worker loads it.
pub type ModuleFactory =
    Arc<dyn Fn(&LoadContext) -> std::result::Result<Module, ModuleError> + Send + Sync>;

/// Where worker responses go: the process's stdout or a thread's channel.
pub trait Outbound: Send + Sync {
    fn send(&self, message: WorkerMessage);

    /// Take the worker down. Called when a panic abandons a call, so the
    /// farm treats the worker as crashed and retries what it held.
    fn abort(&self);
}

/// Named set of loadable modules.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleFactory>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("ModuleRegistry")
            .field("modules", &names)
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `path`, replacing any previous registration.
    pub fn register<F>(&mut self, path: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&LoadContext) -> std::result::Result<Module, ModuleError> + Send + Sync + 'static,
    {
        self.modules.insert(path.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    fn load(&self, path: &str, ctx: &LoadContext) -> std::result::Result<Module, ModuleError> {
        let factory = self
            .modules
            .get(path)
            .ok_or_else(|| ModuleError::new(format!("Cannot find module '{}'", path)))?;
        factory(ctx)
    }
}

/// The exports of a loaded module.
#[derive(Default, Clone)]
pub struct Module {
    default: Option<ExportFn>,
    exports: HashMap<String, ExportFn>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function invoked by calls without a method name.
    pub fn with_default<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Value>, Completion) + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(f));
        self
    }

    /// Add a named export.
    pub fn export<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Completion) + Send + Sync + 'static,
    {
        self.exports.insert(name.into(), Arc::new(f));
        self
    }

    fn resolve(&self, method: Option<&str>) -> Option<&ExportFn> {
        match method {
            Some(name) => self.exports.get(name),
            None => self.default.as_ref(),
        }
    }
}

/// Passed to a module factory while the module loads.
pub struct LoadContext {
    ready: ReadySignal,
}

impl LoadContext {
    /// Handle for announcing that async initialisation has finished.
    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }
}

/// Announces the end of async initialisation to the farm.
///
/// Only meaningful when the farm was configured with async init; otherwise
/// the signal is ignored by the controller.
#[derive(Clone)]
pub struct ReadySignal {
    out: Arc<dyn Outbound>,
}

impl ReadySignal {
    pub fn signal(&self) {
        self.out.send(WorkerMessage::Ready);
    }
}

/// An error raised by an exported function, sent back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleError {
    type_name: String,
    message: String,
    stack: Option<String>,
    fields: Map<String, Value>,
}

impl ModuleError {
    /// A generic error (`Error`).
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_type("Error", message)
    }

    pub fn of_kind(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::with_type(kind.as_tag(), message)
    }

    /// An error with a custom type tag. Tags outside the known set reach
    /// the caller as a generic error that keeps the tag.
    pub fn with_type(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
            fields: Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a custom field, visible to the caller on the received error.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for ModuleError {}

impl From<ModuleError> for WireError {
    fn from(e: ModuleError) -> Self {
        let mut wire = WireError::new(e.type_name, e.message);
        wire.stack = e.stack;
        wire.fields = e.fields;
        wire
    }
}

/// Answers one call. Consumed by answering; dropped unanswered it reports
/// a generic error so the caller is never left waiting.
pub struct Completion {
    idx: usize,
    worker_id: WorkerId,
    out: Arc<dyn Outbound>,
    answered: bool,
}

impl Completion {
    fn new(idx: usize, worker_id: WorkerId, out: Arc<dyn Outbound>) -> Self {
        Self {
            idx,
            worker_id,
            out,
            answered: false,
        }
    }

    pub fn ok(self, results: Vec<Value>) {
        self.complete(Ok(results));
    }

    pub fn err(self, error: ModuleError) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, outcome: std::result::Result<Vec<Value>, ModuleError>) {
        self.answer(outcome.map_err(WireError::from));
    }

    fn answer(&mut self, outcome: std::result::Result<Vec<Value>, WireError>) {
        self.answered = true;
        self.out
            .send(WorkerMessage::result(self.idx, self.worker_id, outcome));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        if std::thread::panicking() {
            // Possibly on a helper thread the worker would otherwise outlive
            tracing::error!(idx = self.idx, "Call abandoned by a panic, taking the worker down");
            self.out.abort();
        } else {
            self.answer(Err(WireError::new(
                "Error",
                "worker function returned without completing the call",
            )));
        }
    }
}

/// Why the serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The controller sent the die message.
    Die,
    /// The controller went away.
    Disconnected,
    /// The requested module could not be loaded.
    LoadFailed,
}

impl ServeExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Die | Self::Disconnected => 0,
            Self::LoadFailed => 1,
        }
    }
}

/// Worker state: the module, once loaded.
struct Adapter<'a> {
    registry: &'a ModuleRegistry,
    out: Arc<dyn Outbound>,
    module: Option<Module>,
}

impl Adapter<'_> {
    fn load(&mut self, path: &str) -> bool {
        if self.module.is_some() {
            tracing::debug!(module = path, "Module already loaded, ignoring load message");
            return true;
        }
        let ctx = LoadContext {
            ready: ReadySignal {
                out: Arc::clone(&self.out),
            },
        };
        match self.registry.load(path, &ctx) {
            Ok(module) => {
                tracing::debug!(module = path, "Loaded module");
                self.module = Some(module);
                true
            }
            Err(e) => {
                tracing::error!(module = path, error = %e, "Failed to load module");
                false
            }
        }
    }

    fn call(&self, idx: usize, worker_id: WorkerId, method: Option<String>, args: Vec<Value>) {
        let mut completion = Completion::new(idx, worker_id, Arc::clone(&self.out));

        let Some(module) = &self.module else {
            completion.answer(Err(WireError::new("Error", "module not loaded")));
            return;
        };

        match module.resolve(method.as_deref()) {
            Some(f) => f(args, completion),
            None => {
                let name = method.as_deref().unwrap_or("<default export>");
                completion.answer(Err(WireError::new(
                    RemoteErrorKind::NoSuchMethod.as_tag(),
                    format!("no such method: {}", name),
                )));
            }
        }
    }
}

/// Serve control messages until the controller says die or goes away.
pub fn serve<I>(incoming: I, out: Arc<dyn Outbound>, registry: &ModuleRegistry) -> ServeExit
where
    I: IntoIterator<Item = ControlMessage>,
{
    let mut adapter = Adapter {
        registry,
        out,
        module: None,
    };

    for message in incoming {
        match message {
            ControlMessage::Load { module } => {
                if !adapter.load(&module) {
                    return ServeExit::LoadFailed;
                }
            }
            ControlMessage::Call {
                idx,
                worker_id,
                method,
                args,
            } => adapter.call(idx, worker_id, method, args),
            ControlMessage::Die => return ServeExit::Die,
        }
    }

    ServeExit::Disconnected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::decode_outcome;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<WorkerMessage>>,
        aborted: AtomicBool,
    }

    impl Outbound for Recorder {
        fn send(&self, message: WorkerMessage) {
            self.sent.lock().unwrap().push(message);
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("calc", |ctx| {
            ctx.ready_signal().signal();
            Ok(Module::new()
                .with_default(|args, done| done.ok(args))
                .export("fail", |_args, done| {
                    done.err(
                        ModuleError::of_kind(RemoteErrorKind::Range, "out of range")
                            .with_field("limit", json!(10)),
                    )
                })
                .export("forget", |_args, _done| {})
                .export("panic-later", |_args, done| {
                    let helper = std::thread::spawn(move || {
                        let _held = done;
                        panic!("helper thread blew up");
                    });
                    let _ = helper.join();
                }))
        });
        registry.register("broken", |_ctx| Err(ModuleError::new("boom")));
        registry
    }

    fn load(path: &str) -> ControlMessage {
        ControlMessage::Load {
            module: path.into(),
        }
    }

    fn outcomes(recorder: &Recorder) -> Vec<(usize, Result<Vec<Value>, crate::error::RemoteError>)> {
        recorder
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Result { idx, args, .. } => {
                    Some((*idx, decode_outcome(args.clone())))
                }
                WorkerMessage::Ready => None,
            })
            .collect()
    }

    #[test]
    fn test_default_and_named_exports() {
        let recorder = Arc::new(Recorder::default());
        let exit = serve(
            vec![
                load("calc"),
                ControlMessage::call(0, 1, None, vec![json!(1), json!(2)]),
                ControlMessage::call(1, 1, Some("fail".into()), vec![]),
                ControlMessage::Die,
                ControlMessage::call(2, 1, None, vec![]),
            ],
            recorder.clone(),
            &registry(),
        );
        assert_eq!(exit, ServeExit::Die);

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent[0], WorkerMessage::Ready);

        let results = outcomes(&recorder);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.as_ref().unwrap(), &vec![json!(1), json!(2)]);
        let err = results[1].1.as_ref().unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Range);
        assert_eq!(err.message(), "out of range");
        assert_eq!(err.field("limit"), Some(&json!(10)));
    }

    #[test]
    fn test_no_such_method() {
        let recorder = Arc::new(Recorder::default());
        serve(
            vec![
                load("calc"),
                ControlMessage::call(0, 1, Some("missing".into()), vec![]),
            ],
            recorder.clone(),
            &registry(),
        );
        let results = outcomes(&recorder);
        let err = results[0].1.as_ref().unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::NoSuchMethod);
        assert_eq!(err.message(), "no such method: missing");
    }

    #[test]
    fn test_dropped_completion_answers() {
        let recorder = Arc::new(Recorder::default());
        let exit = serve(
            vec![
                load("calc"),
                ControlMessage::call(4, 1, Some("forget".into()), vec![]),
            ],
            recorder.clone(),
            &registry(),
        );
        assert_eq!(exit, ServeExit::Disconnected);
        let results = outcomes(&recorder);
        assert_eq!(results[0].0, 4);
        assert!(results[0].1.is_err());
    }

    #[test]
    fn test_panic_on_helper_thread_aborts_worker() {
        let recorder = Arc::new(Recorder::default());
        serve(
            vec![
                load("calc"),
                ControlMessage::call(0, 1, Some("panic-later".into()), vec![]),
            ],
            recorder.clone(),
            &registry(),
        );
        assert!(outcomes(&recorder).is_empty());
        assert!(recorder.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_answered_completion_never_aborts() {
        let recorder = Arc::new(Recorder::default());
        serve(
            vec![load("calc"), ControlMessage::call(0, 1, None, vec![])],
            recorder.clone(),
            &registry(),
        );
        assert_eq!(outcomes(&recorder).len(), 1);
        assert!(!recorder.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_call_before_load() {
        let recorder = Arc::new(Recorder::default());
        serve(
            vec![ControlMessage::call(0, 1, None, vec![])],
            recorder.clone(),
            &registry(),
        );
        let results = outcomes(&recorder);
        assert_eq!(results[0].1.as_ref().unwrap_err().message(), "module not loaded");
    }

    #[test]
    fn test_module_loaded_once() {
        let recorder = Arc::new(Recorder::default());
        serve(vec![load("calc"), load("calc")], recorder.clone(), &registry());
        let ready = recorder
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| **m == WorkerMessage::Ready)
            .count();
        assert_eq!(ready, 1);
    }

    #[test]
    fn test_load_failures() {
        let recorder = Arc::new(Recorder::default());
        let exit = serve(vec![load("broken")], recorder.clone(), &registry());
        assert_eq!(exit, ServeExit::LoadFailed);
        assert_eq!(exit.exit_code(), 1);

        let exit = serve(vec![load("nope")], recorder, &registry());
        assert_eq!(exit, ServeExit::LoadFailed);
    }

    #[test]
    fn test_module_error_to_wire() {
        let wire: WireError = ModuleError::with_type("QuotaError", "over quota")
            .with_stack("at quota")
            .with_field("used", json!(11))
            .into();
        assert_eq!(wire.kind, "QuotaError");
        assert_eq!(wire.stack.as_deref(), Some("at quota"));
        assert_eq!(wire.fields.get("used"), Some(&json!(11)));
    }
}
