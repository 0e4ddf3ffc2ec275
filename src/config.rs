//! Farm configuration.
//!
//! [`FarmConfig`] is built once, validated when the farm is created, and
//! never changes afterwards.
//!
//! # Environment Variables
//!
//! Applied by [`FarmConfig::with_env_overrides`]:
//!
//! - `WORKER_FARM_MAX_WORKERS` - pool size
//! - `WORKER_FARM_MAX_CALLS_PER_WORKER` - lifetime quota per worker (`unbounded` to clear)
//! - `WORKER_FARM_MAX_CONCURRENT_CALLS` - farm-wide admission cap (`unbounded` to clear)
//! - `WORKER_FARM_MAX_CALL_TIME_MS` - per-call timeout in milliseconds (`unbounded` to clear)
//! - `WORKER_FARM_MAX_RETRIES` - crash retries per call (`unbounded` to clear)
//! - `WORKER_FARM_THREADS` - `1`/`true` selects the thread backend

use crate::child::ModuleRegistry;
use crate::error::{FarmError, Result};
use crate::worker::{InitOptions, WorkerInfo};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default in-flight calls per worker.
pub const DEFAULT_MAX_CONCURRENT_CALLS_PER_WORKER: usize = 10;

/// Default grace period before a stopping worker is force-terminated.
pub const DEFAULT_FORCED_KILL_TIME: Duration = Duration::from_millis(100);

/// Default thread name prefix for the thread backend.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "farm-worker";

/// Hook invoked on the controller thread whenever a worker has started.
pub type WorkerHook = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

/// How worker processes (or threads) are launched.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Worker program. `None` re-executes the current executable.
    pub program: Option<PathBuf>,
    /// Extra arguments for the worker program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the worker program.
    pub env: Vec<(OsString, OsString)>,
    /// Working directory of the worker program.
    pub cwd: Option<PathBuf>,
    /// Name prefix of worker threads; the worker id is appended.
    pub thread_name_prefix: String,
    /// Stack size of worker threads.
    pub stack_size: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }
}

impl WorkerOptions {
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Configuration of one farm.
#[derive(Clone)]
pub struct FarmConfig {
    /// Run workers as threads of this process instead of child processes.
    pub enable_worker_threads: bool,
    pub worker_options: WorkerOptions,
    /// Calls a worker may ever be assigned before it is retired.
    pub max_calls_per_worker: Option<usize>,
    /// Pool size: active plus starting workers.
    pub max_concurrent_workers: usize,
    pub max_concurrent_calls_per_worker: usize,
    /// Farm-wide cap on queued plus in-flight calls.
    pub max_concurrent_calls: Option<usize>,
    /// Per-call timeout; a timed-out call takes its worker down with it.
    pub max_call_time: Option<Duration>,
    /// Crash retries per call. `None` retries forever.
    pub max_retries: Option<u32>,
    pub forced_kill_time: Duration,
    /// Start the whole pool when the farm is created.
    pub auto_start: bool,
    pub on_worker_started: Option<WorkerHook>,
    /// Wait for each worker's ready signal before dispatching to it.
    pub async_init: bool,
    pub max_init_time: Option<Duration>,
    /// Modules available to the thread backend.
    pub registry: Option<Arc<ModuleRegistry>>,
}

impl std::fmt::Debug for FarmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmConfig")
            .field("enable_worker_threads", &self.enable_worker_threads)
            .field("worker_options", &self.worker_options)
            .field("max_calls_per_worker", &self.max_calls_per_worker)
            .field("max_concurrent_workers", &self.max_concurrent_workers)
            .field(
                "max_concurrent_calls_per_worker",
                &self.max_concurrent_calls_per_worker,
            )
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("max_call_time", &self.max_call_time)
            .field("max_retries", &self.max_retries)
            .field("forced_kill_time", &self.forced_kill_time)
            .field("auto_start", &self.auto_start)
            .field("on_worker_started", &self.on_worker_started.is_some())
            .field("async_init", &self.async_init)
            .field("max_init_time", &self.max_init_time)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            enable_worker_threads: false,
            worker_options: WorkerOptions::default(),
            max_calls_per_worker: None,
            max_concurrent_workers: default_worker_count(),
            max_concurrent_calls_per_worker: DEFAULT_MAX_CONCURRENT_CALLS_PER_WORKER,
            max_concurrent_calls: None,
            max_call_time: None,
            max_retries: None,
            forced_kill_time: DEFAULT_FORCED_KILL_TIME,
            auto_start: false,
            on_worker_started: None,
            async_init: false,
            max_init_time: None,
            registry: None,
        }
    }
}

/// One worker per available CPU.
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl FarmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the thread backend with the given modules.
    pub fn with_worker_threads(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.enable_worker_threads = true;
        self.registry = Some(registry);
        self
    }

    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    pub fn with_max_calls_per_worker(mut self, max: usize) -> Self {
        self.max_calls_per_worker = Some(max);
        self
    }

    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max;
        self
    }

    pub fn with_max_concurrent_calls_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_calls_per_worker = max;
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = Some(max);
        self
    }

    pub fn with_max_call_time(mut self, max: Duration) -> Self {
        self.max_call_time = Some(max);
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_forced_kill_time(mut self, grace: Duration) -> Self {
        self.forced_kill_time = grace;
        self
    }

    pub fn with_auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    pub fn with_worker_started_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        self.on_worker_started = Some(Arc::new(hook));
        self
    }

    /// Wait for each worker's ready signal, optionally bounded by `max_init_time`.
    pub fn with_async_init(mut self, max_init_time: Option<Duration>) -> Self {
        self.async_init = true;
        self.max_init_time = max_init_time;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_value::<usize>("WORKER_FARM_MAX_WORKERS") {
            self.max_concurrent_workers = n;
        }
        if let Some(limit) = env_limit::<usize>("WORKER_FARM_MAX_CALLS_PER_WORKER") {
            self.max_calls_per_worker = limit;
        }
        if let Some(limit) = env_limit::<usize>("WORKER_FARM_MAX_CONCURRENT_CALLS") {
            self.max_concurrent_calls = limit;
        }
        if let Some(limit) = env_limit::<u64>("WORKER_FARM_MAX_CALL_TIME_MS") {
            self.max_call_time = limit.map(Duration::from_millis);
        }
        if let Some(limit) = env_limit::<u32>("WORKER_FARM_MAX_RETRIES") {
            self.max_retries = limit;
        }
        if let Ok(threads) = std::env::var("WORKER_FARM_THREADS") {
            self.enable_worker_threads = matches!(
                threads.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        self
    }

    /// Check the configuration for values the farm cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workers == 0 {
            return Err(FarmError::Config(
                "max_concurrent_workers must be at least 1".into(),
            ));
        }
        if self.max_concurrent_calls_per_worker == 0 {
            return Err(FarmError::Config(
                "max_concurrent_calls_per_worker must be at least 1".into(),
            ));
        }
        if self.max_calls_per_worker == Some(0) {
            return Err(FarmError::Config(
                "max_calls_per_worker must be at least 1".into(),
            ));
        }
        if self.max_concurrent_calls == Some(0) {
            return Err(FarmError::Config(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.enable_worker_threads && self.registry.is_none() {
            return Err(FarmError::Config(
                "the thread backend needs a module registry".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn init_options(&self) -> InitOptions {
        InitOptions {
            async_init: self.async_init,
            max_init_time: self.max_init_time,
            forced_kill_time: self.forced_kill_time,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid environment override");
            None
        }
    }
}

/// Parse a limit that may be cleared with `unbounded`/`infinity`.
fn env_limit<T: FromStr>(name: &str) -> Option<Option<T>> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "unbounded" | "infinity" | "inf" | "none" => Some(None),
        _ => env_value(name).map(Some),
    }
}
