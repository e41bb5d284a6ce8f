//! Pool size policy: a pure function of the latest metrics sample.

use crate::config::PoolConfig;
use crate::metrics::ResourceMetrics;

const MEMORY_HIGH: f64 = 0.8;
const MEMORY_MEDIUM: f64 = 0.6;
const CPU_HIGH: f64 = 0.8;
const CPU_MEDIUM: f64 = 0.6;
const DISK_HIGH: f64 = 0.9;
const DISK_MEDIUM: f64 = 0.7;
const MIN_CONSTRAINT: f64 = 0.2;

/// Computes the target worker count for a sample.
#[derive(Debug, Clone)]
pub struct PoolSizeOptimizer {
    config: PoolConfig,
}

impl PoolSizeOptimizer {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    pub fn min_pool_size(&self) -> usize {
        self.config.min_pool_size.max(1)
    }

    pub fn max_pool_size(&self) -> usize {
        self.config.max_pool_size.max(self.min_pool_size())
    }

    /// Load-based size before any resource constraint: at least one worker.
    pub fn base_size(&self, metrics: &ResourceMetrics) -> usize {
        let per_worker = self.config.requests_per_worker.max(1);
        metrics.active_requests.div_ceil(per_worker).max(1)
    }

    /// Product of per-dimension multipliers, floored at 0.2.
    pub fn constraint_multiplier(&self, metrics: &ResourceMetrics) -> f64 {
        let step = |value: f64, high: f64, medium: f64, at_high: f64, at_medium: f64| {
            if value > high {
                at_high
            } else if value > medium {
                at_medium
            } else {
                1.0
            }
        };
        let multiplier = step(metrics.memory_usage, MEMORY_HIGH, MEMORY_MEDIUM, 0.4, 0.7)
            * step(metrics.cpu_usage, CPU_HIGH, CPU_MEDIUM, 0.5, 0.8)
            * step(metrics.disk_usage, DISK_HIGH, DISK_MEDIUM, 0.6, 0.9);
        multiplier.max(MIN_CONSTRAINT)
    }

    pub fn load_factor(&self, metrics: &ResourceMetrics) -> f64 {
        let utilization = metrics.utilization();
        if utilization > 3.0 {
            1.3
        } else if utilization > 2.0 {
            1.1
        } else if utilization < 0.5 && metrics.worker_count > 1 {
            0.7
        } else {
            1.0
        }
    }

    /// Target pool size, always within `[min_pool_size, max_pool_size]`.
    pub fn optimal(&self, metrics: &ResourceMetrics) -> usize {
        let raw = self.base_size(metrics) as f64
            * self.constraint_multiplier(metrics)
            * self.load_factor(metrics);
        (raw.floor() as usize).clamp(self.min_pool_size(), self.max_pool_size())
    }

    /// Incremental growth hint for callers that step one worker at a time.
    pub fn should_expand(&self, metrics: &ResourceMetrics) -> bool {
        metrics.memory_usage < self.config.memory_target
            && metrics.active_requests > metrics.worker_count * 2
            && metrics.worker_count < self.max_pool_size()
    }

    pub fn should_shrink(&self, metrics: &ResourceMetrics) -> bool {
        metrics.worker_count > self.min_pool_size()
            && (metrics.memory_usage > MEMORY_HIGH
                || metrics.active_requests < metrics.worker_count)
    }
}
