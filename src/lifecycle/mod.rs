//! Worker lifetime management.
//!
//! This module is organized into submodules:
//! - `worker` - the [`Worker`] and [`WorkerFactory`] seams
//! - `manager` - the registry, termination protocol and periodic cleanup
//! - `process` - a subprocess-backed worker for `tokio::process`

mod manager;
mod process;
mod worker;

pub use manager::{
    CleanupCycleReport, EmergencyCleanupReport, LifecycleManager, TerminationOutcome,
    TerminationReport, WorkerFailure, WorkerInfo,
};
pub use process::{CommandWorker, CommandWorkerFactory, CommandWorkerOptions, PROFILE_DIR_PREFIX};
pub use worker::{Worker, WorkerFactory, WorkerId};

#[cfg(test)]
pub(crate) use worker::testing;
