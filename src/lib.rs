//! worker-farm - a pool of persistent workers
//!
//! Calls made through a farm are queued, dispatched round-robin to a bounded
//! pool of workers (child processes or threads), retried when a worker dies,
//! failed when they run past their time limit, and rejected once the farm is
//! at capacity or shutting down. Every call's continuation runs exactly once.
//!
//! A worker process is the same binary (or a dedicated worker program) with
//! [`child::CHILD_ENV`] set; it must call [`child::run_if_worker`] early in
//! `main` so it serves calls instead of running the host program.

pub mod child;
pub mod config;
pub mod error;
mod farm;
pub mod interface;
pub mod logging;
pub mod worker;

pub use child::{Completion, Module, ModuleError, ModuleRegistry, run_if_worker};
pub use config::{FarmConfig, WorkerOptions};
pub use error::{FarmError, RemoteError, RemoteErrorKind, Result};
pub use farm::{CallResult, Callback, QueueInfo, ShutdownCallback};
pub use interface::{CallOptions, Method, PendingCall, Workers, create_farm, introspect, shutdown};
pub use worker::WorkerInfo;
