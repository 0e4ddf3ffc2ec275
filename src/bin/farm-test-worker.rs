//! Worker program for the integration tests.
//!
//! Serves the fixture modules in `tests/support/modules.rs` when spawned by
//! a farm.

use anyhow::bail;
use worker_farm::child::{CHILD_ENV, run_if_worker};
use worker_farm::logging::{LogConfig, init};

#[path = "../../tests/support/modules.rs"]
mod modules;

fn main() -> anyhow::Result<()> {
    init(LogConfig::for_worker().with_env_overrides());

    let registry = modules::registry();
    run_if_worker(&registry);

    bail!(
        "farm-test-worker only runs as a farm worker ({} is not set)",
        CHILD_ENV
    )
}
