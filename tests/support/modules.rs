//! Fixture modules served by the integration test workers.
//!
//! Compiled into the `farm-test-worker` binary for the process backend and
//! directly into the thread backend tests. Crash fixtures exit the process
//! when running in a worker process and panic the worker thread otherwise.

#![allow(dead_code)]

use serde_json::{Map, Value, json};
use std::fs;
use std::thread;
use std::time::Duration;
use worker_farm::child::{CHILD_ENV, Completion, Module, ModuleError, ModuleRegistry};

/// Fixture module with the call-behaviour exports.
pub const CALLS: &str = "fixtures/calls";
/// Signals ready shortly after loading.
pub const ASYNC_READY: &str = "fixtures/async-ready";
/// Never signals ready.
pub const NEVER_READY: &str = "fixtures/never-ready";
/// Fails while loading.
pub const BROKEN: &str = "fixtures/broken";
/// Loads, and signals ready, only in the worker that first claims the
/// marker file named by [`MARKER_ENV`]. Every later worker fails to load.
pub const FIRST_ONLY: &str = "fixtures/first-only";
pub const MARKER_ENV: &str = "FARM_FIXTURE_MARKER";

fn in_worker_process() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Take the worker down: exit the process, or panic the worker thread.
fn crash(reason: &str) -> ! {
    if in_worker_process() {
        std::process::exit(3);
    }
    panic!("{}", reason);
}

fn millis(args: &[Value], i: usize) -> Option<Duration> {
    args.get(i).and_then(Value::as_u64).map(Duration::from_millis)
}

/// `[pid, worker thread name]` identifying who served the call.
fn identity() -> Value {
    json!([
        std::process::id(),
        thread::current().name().unwrap_or("unnamed")
    ])
}

/// Default export: answer with the worker identity, after `args[0]` ms.
fn whoami(args: Vec<Value>, done: Completion) {
    let who = identity();
    match millis(&args, 0) {
        Some(delay) => {
            thread::spawn(move || {
                thread::sleep(delay);
                done.ok(vec![who]);
            });
        }
        None => done.ok(vec![who]),
    }
}

/// Succeeds once the counter in file `args[0]` reaches `args[1]`,
/// crashing on every attempt before that.
fn stubborn(args: Vec<Value>, done: Completion) {
    let path = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
    let succeed_at = args.get(1).and_then(Value::as_u64).unwrap_or(1);

    let attempts = fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    if let Err(e) = fs::write(&path, attempts.to_string()) {
        done.err(ModuleError::new(format!("cannot write {}: {}", path, e)));
        return;
    }

    if attempts < succeed_at {
        crash("stubborn worker crashing");
    }
    done.ok(vec![json!(attempts)]);
}

/// Raises an error of type `args[0]` with message `args[1]` and the fields of
/// the object `args[2]`.
fn raise(args: Vec<Value>, done: Completion) {
    let type_name = args.first().and_then(Value::as_str).unwrap_or("Error");
    let message = args.get(1).and_then(Value::as_str).unwrap_or_default();
    let fields = args
        .get(2)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    let mut error = ModuleError::with_type(type_name, message).with_stack(format!(
        "{}: {}\n    at raise (fixtures/calls)",
        type_name, message
    ));
    for (name, value) in fields {
        error = error.with_field(name, value);
    }
    done.err(error);
}

/// The calls module's exports.
fn calls() -> Module {
    Module::new()
        .with_default(whoami)
        .export("args", |args, done| done.ok(args))
        .export("multi", |_args, done| {
            done.ok(vec![json!(1), json!("two"), json!({"three": 3})])
        })
        // Blocks the worker itself for `args[0]` ms (default one minute)
        .export("block", |args, done| {
            thread::sleep(millis(&args, 0).unwrap_or(Duration::from_secs(60)));
            done.ok(vec![json!("unblocked")]);
        })
        .export("die", |_args, _done| crash("worker told to die"))
        // Panics on a helper thread that holds the completion
        .export("panic-later", |_args, done| {
            thread::spawn(move || {
                let _held = done;
                panic!("helper thread blew up");
            });
        })
        .export("stubborn", stubborn)
        .export("raise", raise)
        .export("forget", |_args, _done| {})
}

/// Every fixture module, registered under its path.
pub fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(CALLS, |_ctx| Ok(calls()))
        .register(ASYNC_READY, |ctx| {
            let ready = ctx.ready_signal();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ready.signal();
            });
            Ok(calls())
        })
        .register(NEVER_READY, |_ctx| Ok(calls()))
        .register(BROKEN, |_ctx| Err(ModuleError::new("fixture refuses to load")))
        .register(FIRST_ONLY, |ctx| {
            let marker = std::env::var_os(MARKER_ENV)
                .ok_or_else(|| ModuleError::new(format!("{} is not set", MARKER_ENV)))?;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
                .map_err(|e| ModuleError::new(format!("marker already claimed: {}", e)))?;
            ctx.ready_signal().signal();
            Ok(calls())
        });
    registry
}
