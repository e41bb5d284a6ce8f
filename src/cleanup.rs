//! Temporary artifact cleanup: profile directories and cache files left behind
//! by rendering workers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CleanupConfig, ResourceLimits};
use crate::events::{EventBus, GovernorEvent};
use crate::{GovernorError, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Entries whose name matched a pattern.
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    pub errors: usize,
}

#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    is_dir: bool,
    size: u64,
    age: Duration,
}

#[derive(Debug)]
struct Scan {
    artifacts: Vec<Artifact>,
    errors: usize,
}

pub struct CleanupScheduler {
    directories: Vec<PathBuf>,
    patterns: Vec<Regex>,
    max_age: Duration,
    pressure_max_age: Duration,
    max_file_bytes: u64,
    max_disk_bytes: u64,
    interval: Duration,
    events: EventBus,
}

impl CleanupScheduler {
    pub fn new(config: &CleanupConfig, limits: &ResourceLimits, events: EventBus) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    GovernorError::Config(format!("cleanup pattern '{}' is invalid: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            directories: config.resolved_directories(),
            patterns,
            max_age: config.max_age,
            pressure_max_age: config.pressure_max_age,
            max_file_bytes: config.max_file_mb.saturating_mul(BYTES_PER_MB),
            max_disk_bytes: limits.max_disk_mb.saturating_mul(BYTES_PER_MB),
            interval: config.interval,
            events,
        })
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(file_name))
    }

    /// One pass. `high_disk_pressure` switches to the short age ceiling; so does
    /// finding more matched bytes than the disk limit allows.
    pub async fn run(&self, high_disk_pressure: bool) -> CleanupReport {
        let directories = self.directories.clone();
        let patterns = self.patterns.clone();
        let scanned =
            tokio::task::spawn_blocking(move || scan_directories(&directories, &patterns)).await;
        let scan = match scanned {
            Ok(scan) => scan,
            Err(err) => {
                warn!(error = %err, "temp artifact scan aborted");
                return CleanupReport {
                    errors: 1,
                    ..CleanupReport::default()
                };
            }
        };

        let total: u64 = scan.artifacts.iter().map(|a| a.size).sum();
        let aggressive = high_disk_pressure || total > self.max_disk_bytes;
        let age_limit = if aggressive {
            self.pressure_max_age
        } else {
            self.max_age
        };

        let doomed: Vec<&Artifact> = scan
            .artifacts
            .iter()
            .filter(|a| a.age > age_limit || (!a.is_dir && a.size > self.max_file_bytes))
            .collect();

        let results = join_all(doomed.iter().map(|a| remove(a))).await;

        let mut report = CleanupReport {
            scanned: scan.artifacts.len(),
            errors: scan.errors,
            ..CleanupReport::default()
        };
        for (artifact, result) in doomed.iter().zip(results) {
            match result {
                Ok(true) => {
                    report.removed += 1;
                    report.bytes_freed += artifact.size;
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(path = %artifact.path.display(), error = %err, "could not remove temp artifact");
                    report.errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            bytes_freed = report.bytes_freed,
            errors = report.errors,
            aggressive,
            "temp cleanup finished"
        );
        self.events.emit(GovernorEvent::TempFilesCleaned(report));
        report
    }

    /// Run every `interval` until cancelled. `pressure` is polled before each pass.
    pub fn spawn_periodic<F>(self: Arc<Self>, pressure: F, cancel: CancellationToken) -> JoinHandle<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run(pressure()).await;
                    }
                }
            }
            debug!("temp cleanup loop stopped");
        })
    }
}

fn scan_directories(directories: &[PathBuf], patterns: &[Regex]) -> Scan {
    let now = SystemTime::now();
    let mut result = Scan {
        artifacts: Vec::new(),
        errors: 0,
    };
    for dir in directories {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "cleanup directory does not exist");
                continue;
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cannot read cleanup directory");
                result.errors += 1;
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !patterns.iter().any(|p| p.is_match(&name)) {
                continue;
            }
            let path = entry.path();
            // Gone or unreadable entries are skipped silently.
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            let is_dir = meta.is_dir();
            let size = if is_dir { dir_size(&path) } else { meta.len() };
            result.artifacts.push(Artifact {
                path,
                is_dir,
                size,
                age,
            });
        }
    }
    result
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

/// `Ok(false)` when the artifact disappeared before we got to it.
async fn remove(artifact: &Artifact) -> io::Result<bool> {
    let result = if artifact.is_dir {
        tokio::fs::remove_dir_all(&artifact.path).await
    } else {
        tokio::fs::remove_file(&artifact.path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
