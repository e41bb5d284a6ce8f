//! System-wide orphan sweep.
//!
//! The reaper finds rendering-engine processes by command-line signature, not by
//! registry membership, so it still works after the registry was lost to a crash.
//!
//! - [`inspector`] - the [`ProcessInspector`] seam and its `sysinfo` implementation

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ReaperConfig;
use crate::{GovernorError, Result};

pub mod inspector;

pub use inspector::{
    descends_from, ProcessInfo, ProcessInspector, ProcessSignature, SysinfoInspector,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub found: usize,
    pub killed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Matches still present after the settle delay.
    pub residual: usize,
}

#[derive(Clone)]
pub struct OrphanReaper {
    inspector: Arc<dyn ProcessInspector>,
    signature: ProcessSignature,
    settle_delay: Duration,
}

impl OrphanReaper {
    pub fn new(inspector: Arc<dyn ProcessInspector>, config: &ReaperConfig) -> Self {
        Self {
            inspector,
            signature: ProcessSignature::from_config(config),
            settle_delay: config.settle_delay,
        }
    }

    pub fn with_signature(mut self, signature: ProcessSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn signature(&self) -> &ProcessSignature {
        &self.signature
    }

    /// List matching processes without touching them.
    pub async fn scan(&self) -> Result<Vec<ProcessInfo>> {
        let inspector = self.inspector.clone();
        let signature = self.signature.clone();
        tokio::task::spawn_blocking(move || inspector.list_by_signature(&signature))
            .await
            .map_err(|e| GovernorError::Process(format!("process scan aborted: {}", e)))?
    }

    /// Kill every matching process.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_excluding(&HashSet::new()).await
    }

    /// Kill every matching process except `spared` (e.g. live registered
    /// workers) and anything running below a spared process.
    pub async fn sweep_excluding(&self, spared: &HashSet<u32>) -> SweepReport {
        let inspector = self.inspector.clone();
        let signature = self.signature.clone();
        let spared = spared.clone();
        let pass = tokio::task::spawn_blocking(move || {
            kill_unspared(inspector.as_ref(), &signature, &spared)
        })
        .await
        .map_err(|e| GovernorError::Process(format!("process sweep aborted: {}", e)))
        .and_then(|pass| pass);

        let (mut report, targets) = match pass {
            Ok(pass) => pass,
            Err(err) => {
                warn!(error = %err, "orphan scan failed");
                return SweepReport {
                    errors: vec![err.to_string()],
                    ..SweepReport::default()
                };
            }
        };
        if targets.is_empty() {
            return report;
        }

        tokio::time::sleep(self.settle_delay).await;

        report.residual = match self.scan().await {
            Ok(after) => after.iter().filter(|p| targets.contains(&p.pid)).count(),
            Err(err) => {
                report.errors.push(err.to_string());
                0
            }
        };
        if report.residual > 0 {
            warn!(
                residual = report.residual,
                "orphaned workers survived the sweep"
            );
        }
        info!(
            found = report.found,
            killed = report.killed,
            residual = report.residual,
            "orphan sweep finished"
        );
        report
    }
}

/// Scan, drop everything at or below a spared pid, kill the rest.
/// Returns the partial report and the pids a kill was attempted on.
fn kill_unspared(
    inspector: &dyn ProcessInspector,
    signature: &ProcessSignature,
    spared: &HashSet<u32>,
) -> Result<(SweepReport, HashSet<u32>)> {
    let found = inspector.list_by_signature(signature)?;
    let targets: Vec<ProcessInfo> = found
        .into_iter()
        .filter(|p| {
            let spare = spared.contains(&p.pid)
                || p.parent.is_some_and(|parent| {
                    descends_from(parent, spared, |pid| inspector.parent_of(pid))
                });
            if spare {
                debug!(pid = p.pid, "sparing process owned by a live worker");
            }
            !spare
        })
        .collect();

    let mut report = SweepReport {
        found: targets.len(),
        ..SweepReport::default()
    };
    for target in &targets {
        match inspector.kill(target.pid) {
            Ok(()) => report.killed += 1,
            Err(err) => {
                warn!(pid = target.pid, error = %err, "failed to kill orphaned worker");
                report.errors.push(format!("pid {}: {}", target.pid, err));
            }
        }
    }
    Ok((report, targets.iter().map(|t| t.pid).collect()))
}
