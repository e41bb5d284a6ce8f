//! Host resource probing.
//!
//! [`MetricsSampler`] never fails: a probe that errors is replaced by
//! [`PLACEHOLDER_USAGE`] and the sample still lands in the history.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use sysinfo::{Disks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use super::{clamp_ratio, now_ms, MetricsHistory, ResourceMetrics};
use crate::config::SamplingConfig;
use crate::reaper::descends_from;
use crate::{GovernorError, Result};

/// Conservative stand-in for a dimension that could not be measured.
pub const PLACEHOLDER_USAGE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub used_ratio: f64,
    pub total_mb: u64,
}

/// Source of raw host measurements.
pub trait SystemProbe: Send {
    fn memory(&mut self) -> Result<MemoryReading>;

    /// Opens a CPU measurement window; [`SystemProbe::cpu_usage`] closes it.
    fn begin_cpu_window(&mut self) -> Result<()>;

    fn cpu_usage(&mut self) -> Result<f64>;

    fn disk_usage(&mut self) -> Result<f64>;

    /// Resident megabytes of this process, `worker_pids` and everything
    /// running below them.
    fn process_memory_mb(&mut self, worker_pids: &[u32]) -> Result<u64>;
}

/// [`SystemProbe`] backed by `sysinfo`; honours cgroup memory limits when present.
pub struct SysinfoProbe {
    system: System,
    disk_path: PathBuf,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::for_path(std::env::temp_dir())
    }

    /// Probe disk usage of the filesystem holding `disk_path`.
    pub fn for_path(disk_path: PathBuf) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system, disk_path }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory(&mut self) -> Result<MemoryReading> {
        self.system.refresh_memory();
        let (total, used) = match self.system.cgroup_limits() {
            Some(limits) => (
                limits.total_memory,
                limits.total_memory.saturating_sub(limits.free_memory),
            ),
            None => (self.system.total_memory(), self.system.used_memory()),
        };
        if total == 0 {
            return Err(GovernorError::Process(
                "total memory reported as zero".to_string(),
            ));
        }
        Ok(MemoryReading {
            used_ratio: used as f64 / total as f64,
            total_mb: total / (1024 * 1024),
        })
    }

    fn begin_cpu_window(&mut self) -> Result<()> {
        self.system.refresh_cpu_usage();
        Ok(())
    }

    fn cpu_usage(&mut self) -> Result<f64> {
        self.system.refresh_cpu_usage();
        Ok(self.system.global_cpu_usage() as f64 / 100.0)
    }

    fn disk_usage(&mut self) -> Result<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                GovernorError::Process(format!(
                    "no mounted disk holds {}",
                    self.disk_path.display()
                ))
            })?;
        let total = disk.total_space();
        if total == 0 {
            return Err(GovernorError::Process(format!(
                "disk {} reports zero capacity",
                disk.mount_point().display()
            )));
        }
        Ok(1.0 - disk.available_space() as f64 / total as f64)
    }

    fn process_memory_mb(&mut self, worker_pids: &[u32]) -> Result<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let mut roots: HashSet<u32> = worker_pids.iter().copied().collect();
        roots.insert(std::process::id());

        let processes = self.system.processes();
        let bytes: u64 = processes
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .filter(|(pid, _)| {
                descends_from(pid.as_u32(), &roots, |child| {
                    processes
                        .get(&Pid::from_u32(child))
                        .and_then(|p| p.parent())
                        .map(|p| p.as_u32())
                })
            })
            .map(|(_, process)| process.memory())
            .sum();
        Ok(bytes / (1024 * 1024))
    }
}

/// Produces [`ResourceMetrics`] and keeps the bounded history.
pub struct MetricsSampler {
    probe: Box<dyn SystemProbe>,
    history: MetricsHistory,
    cpu_window: Duration,
    last_timestamp: u64,
}

impl MetricsSampler {
    pub fn new(probe: Box<dyn SystemProbe>, config: &SamplingConfig) -> Self {
        Self {
            probe,
            history: MetricsHistory::new(config.history_capacity),
            cpu_window: config.cpu_window,
            last_timestamp: 0,
        }
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn latest(&self) -> Option<ResourceMetrics> {
        self.history.latest().copied()
    }

    /// Take one sample. Suspends only for the CPU measurement window.
    ///
    /// `worker_pids` are the processes whose trees count against the memory
    /// quota together with this process.
    pub async fn sample(
        &mut self,
        worker_count: usize,
        active_requests: usize,
        worker_pids: &[u32],
    ) -> ResourceMetrics {
        let (memory_usage, memory_total_mb) = match self.probe.memory() {
            Ok(reading) => (reading.used_ratio, reading.total_mb),
            Err(err) => {
                debug!(error = %err, "memory probe failed; using placeholder");
                (PLACEHOLDER_USAGE, 0)
            }
        };

        let cpu_usage = match self.probe.begin_cpu_window() {
            Ok(()) => {
                if !self.cpu_window.is_zero() {
                    tokio::time::sleep(self.cpu_window).await;
                }
                self.probe.cpu_usage()
            }
            Err(err) => Err(err),
        }
        .unwrap_or_else(|err| {
            debug!(error = %err, "cpu probe failed; using placeholder");
            PLACEHOLDER_USAGE
        });

        let disk_usage = self.probe.disk_usage().unwrap_or_else(|err| {
            debug!(error = %err, "disk probe failed; using placeholder");
            PLACEHOLDER_USAGE
        });

        // An unmeasured footprint never trips the memory quota.
        let process_memory_mb = self
            .probe
            .process_memory_mb(worker_pids)
            .unwrap_or_else(|err| {
                debug!(error = %err, "process memory probe failed");
                0
            });

        // Timestamps strictly increase even if the wall clock stalls or steps back.
        let timestamp_ms = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp_ms;

        let sample = ResourceMetrics {
            memory_usage: clamp_ratio(memory_usage),
            cpu_usage: clamp_ratio(cpu_usage),
            disk_usage: clamp_ratio(disk_usage),
            memory_total_mb,
            process_memory_mb,
            worker_count,
            active_requests,
            timestamp_ms,
        };
        self.history.push(sample);
        sample
    }
}
