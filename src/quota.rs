//! Hard administrative limits and the corrective actions for breaching them.
//!
//! Enforcement only changes admission policy for future work; nothing already
//! admitted is interrupted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ResourceLimits;
use crate::degradation::DegradationController;
use crate::events::{EventBus, GovernorEvent};
use crate::metrics::ResourceMetrics;

/// Advisory hook invoked when memory is over quota. It may free caches or
/// ask an allocator to trim; the governor does not wait for any effect.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaViolations {
    pub memory: bool,
    pub cpu: bool,
    pub concurrency: bool,
    pub workers: bool,
}

impl QuotaViolations {
    pub fn any(&self) -> bool {
        self.memory || self.cpu || self.concurrency || self.workers
    }

    fn to_bits(self) -> u8 {
        self.memory as u8
            | (self.cpu as u8) << 1
            | (self.concurrency as u8) << 2
            | (self.workers as u8) << 3
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            memory: bits & 1 != 0,
            cpu: bits & 2 != 0,
            concurrency: bits & 4 != 0,
            workers: bits & 8 != 0,
        }
    }
}

/// Per-dimension comparison of a sample against the limits.
pub fn check(metrics: &ResourceMetrics, limits: &ResourceLimits) -> QuotaViolations {
    QuotaViolations {
        memory: metrics.process_memory_mb > limits.max_memory_mb,
        cpu: metrics.cpu_usage * 100.0 > limits.max_cpu_percent,
        concurrency: metrics.active_requests > limits.max_concurrent_requests,
        workers: metrics.worker_count > limits.max_worker_instances,
    }
}

pub fn violates(metrics: &ResourceMetrics, limits: &ResourceLimits) -> bool {
    check(metrics, limits).any()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementAction {
    ReclaimMemory,
    ShrinkPool,
    EnableThrottling,
}

pub struct QuotaEnforcer {
    limits: ResourceLimits,
    shrink_on_memory: bool,
    degradation: Arc<DegradationController>,
    events: EventBus,
    reclaim_hook: Option<ReclaimHook>,
    last: AtomicU8,
}

impl QuotaEnforcer {
    /// `shrink_on_memory` mirrors whether degradation is enabled.
    pub fn new(
        limits: ResourceLimits,
        shrink_on_memory: bool,
        degradation: Arc<DegradationController>,
        events: EventBus,
    ) -> Self {
        Self {
            limits,
            shrink_on_memory,
            degradation,
            events,
            reclaim_hook: None,
            last: AtomicU8::new(0),
        }
    }

    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim_hook = Some(hook);
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn violates(&self, metrics: &ResourceMetrics) -> bool {
        violates(metrics, &self.limits)
    }

    /// Violations seen by the most recent [`QuotaEnforcer::observe`].
    pub fn last_violations(&self) -> QuotaViolations {
        QuotaViolations::from_bits(self.last.load(Ordering::Acquire))
    }

    /// Check a sample, remember the result and enforce when anything is breached.
    pub fn observe(&self, metrics: &ResourceMetrics) -> Vec<EnforcementAction> {
        let violations = check(metrics, &self.limits);
        self.last.store(violations.to_bits(), Ordering::Release);
        if violations.any() {
            self.enforce(metrics)
        } else {
            Vec::new()
        }
    }

    /// Dispatch one corrective action per violated dimension. Safe to repeat.
    pub fn enforce(&self, metrics: &ResourceMetrics) -> Vec<EnforcementAction> {
        let violations = check(metrics, &self.limits);
        if !violations.any() {
            return Vec::new();
        }
        warn!(
            ?violations,
            memory_mb = metrics.process_memory_mb,
            cpu_percent = metrics.cpu_usage * 100.0,
            active_requests = metrics.active_requests,
            workers = metrics.worker_count,
            "quota violated"
        );
        self.events.emit(GovernorEvent::QuotaViolated(violations));

        let mut actions = Vec::new();
        let mut push = |action: EnforcementAction| {
            if !actions.contains(&action) {
                actions.push(action);
            }
        };

        if violations.memory {
            self.reclaim_memory();
            push(EnforcementAction::ReclaimMemory);
            if self.shrink_on_memory {
                self.degradation.request_pool_shrink();
                push(EnforcementAction::ShrinkPool);
            }
        }
        if violations.cpu || violations.concurrency {
            self.degradation.enable_request_throttling();
            push(EnforcementAction::EnableThrottling);
        }
        if violations.workers {
            self.degradation.request_pool_shrink();
            push(EnforcementAction::ShrinkPool);
        }
        actions
    }

    fn reclaim_memory(&self) {
        self.events.emit(GovernorEvent::MemoryReclaimRequested);
        match &self.reclaim_hook {
            Some(hook) => hook(),
            None => debug!("memory reclaim requested; no reclaim hook installed"),
        }
    }
}
