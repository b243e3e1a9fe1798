// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Distributed load-test orchestration engine: a multi-region instance
//! pool with tag-based recovery, a fan-out primitive for operating over
//! collections of remote instances, the side-car extensions that bring
//! those instances to readiness, and the run-manager state machine that
//! drives a plan from INITIALIZING through COMPLETED.
//!
//! The CLI/REST entry points, SQL ORM, plan-JSON parsing, and the wire
//! protocol of the container runtime itself are out of scope (spec
//! section 1) -- this crate is the orchestration core a binary wires up
//! to those collaborators.

pub mod collection;
pub mod container_runtime;
pub mod error;
pub mod extensions;
pub mod instance;
pub mod model;
pub mod ping;
pub mod pool;
pub mod retry;
pub mod run_manager;
pub mod run_store;
pub mod settings;
pub mod ssh;
pub mod util;

/// Installs a `tracing` subscriber reading filter directives from
/// `RUST_LOG` (falling back to `info`), matching the logging setup
/// convention of the teacher workspace's binaries.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
