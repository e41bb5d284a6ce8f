//! Resource metrics: snapshots, bounded history, sampling and pressure.
//!
//! - [`sampler`] - periodic probing of memory, CPU and disk usage
//! - [`pressure`] - mapping a snapshot onto soft-threshold pressure flags

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod pressure;
pub mod sampler;

/// Immutable snapshot of host resource usage and pool load.
///
/// All ratios are clamped to `[0, 1]` on construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub disk_usage: f64,
    /// Capacity the memory ratio refers to (0 when unknown).
    pub memory_total_mb: u64,
    /// Resident memory of this process and the process trees of its workers.
    pub process_memory_mb: u64,
    pub worker_count: usize,
    pub active_requests: usize,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ResourceMetrics {
    pub fn new(
        memory_usage: f64,
        cpu_usage: f64,
        disk_usage: f64,
        worker_count: usize,
        active_requests: usize,
    ) -> Self {
        Self {
            memory_usage: clamp_ratio(memory_usage),
            cpu_usage: clamp_ratio(cpu_usage),
            disk_usage: clamp_ratio(disk_usage),
            memory_total_mb: 0,
            process_memory_mb: 0,
            worker_count,
            active_requests,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_memory_total_mb(mut self, total_mb: u64) -> Self {
        self.memory_total_mb = total_mb;
        self
    }

    pub fn with_process_memory_mb(mut self, process_mb: u64) -> Self {
        self.process_memory_mb = process_mb;
        self
    }

    /// Requests per worker; 0 when no worker is registered.
    pub fn utilization(&self) -> f64 {
        if self.worker_count == 0 {
            0.0
        } else {
            self.active_requests as f64 / self.worker_count as f64
        }
    }
}

/// Clamp to `[0, 1]`, mapping NaN to 0.
pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Most-recent-N rolling window of samples; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    samples: VecDeque<ResourceMetrics>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: ResourceMetrics) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&ResourceMetrics> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceMetrics> {
        self.samples.iter()
    }

    /// Mean per-sample change of requests-per-worker across the window.
    pub fn utilization_trend(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) if self.samples.len() >= 2 => {
                (last.utilization() - first.utilization()) / (self.samples.len() - 1) as f64
            }
            _ => 0.0,
        }
    }
}
