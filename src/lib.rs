//! pagegov Library
//!
//! An adaptive resource governor for pools of headless rendering workers
//! (browser subprocesses). It samples host resources, classifies pressure,
//! sizes the worker pool, enforces hard quotas, degrades service in steps,
//! retires and force-kills workers, reaps orphaned engine processes and
//! clears leaked temp artifacts.
//!
//! # Module Overview
//!
//! - [`metrics`] - Resource samples, the sampler and pressure classification
//! - [`optimizer`] - Target pool size policy
//! - [`quota`] - Hard limits and their corrective actions
//! - [`degradation`] - Service degradation flags
//! - [`lifecycle`] - Worker registry, termination and periodic cleanup
//! - [`reaper`] - Orphaned worker process detection and termination
//! - [`cleanup`] - Temp artifact cleanup
//! - [`governor`] - The composition root: governance tick and admission
//! - [`config`] - Configuration file support
//! - [`output`] - JSON output schemas
//!
//! # Example
//!
//! ```no_run
//! use pagegov_lib::{Admission, Governor, GovernorConfig};
//!
//! # async fn example() -> pagegov_lib::Result<()> {
//! let governor = Governor::new(GovernorConfig::load(None)?)?;
//! governor.start();
//! governor.install_signal_handlers();
//!
//! let lease = governor.acquire().await?;
//! // ... drive lease.worker() to render a page
//! governor.release(lease).await;
//!
//! if let Admission::Reject(reason) = governor.try_acquire().await {
//!     eprintln!("busy: {reason}");
//! }
//! governor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod degradation;
pub mod error;
pub mod events;
pub mod governor;
pub mod lifecycle;
pub mod metrics;
pub mod optimizer;
pub mod output;
pub mod quota;
pub mod reaper;

pub use cleanup::{CleanupReport, CleanupScheduler};
pub use config::GovernorConfig;
pub use degradation::{DegradationController, DegradationFlag, DegradationState};
pub use error::{ErrorCategory, ErrorPayload, GovernorError, Result};
pub use events::{EventBus, GovernorEvent};
pub use governor::{
    Admission, ForceCleanupReport, Governor, GovernorBuilder, GovernorStatus, WorkerLease,
};
pub use lifecycle::{
    CleanupCycleReport, CommandWorker, CommandWorkerFactory, CommandWorkerOptions,
    EmergencyCleanupReport, LifecycleManager, TerminationOutcome, TerminationReport, Worker,
    WorkerFactory, WorkerId, WorkerInfo,
};
pub use metrics::pressure::{classify, PressureTracker, PressureVector};
pub use metrics::sampler::{MetricsSampler, SysinfoProbe, SystemProbe};
pub use metrics::{MetricsHistory, ResourceMetrics};
pub use optimizer::PoolSizeOptimizer;
pub use output::{
    CleanTempOutput, ErrorOutput, GovOutput, ProbeOutput, SweepOutput, PAGEGOV_OUTPUT_VERSION,
};
pub use quota::{EnforcementAction, QuotaEnforcer, QuotaViolations};
pub use reaper::{
    OrphanReaper, ProcessInfo, ProcessInspector, ProcessSignature, SweepReport, SysinfoInspector,
};
