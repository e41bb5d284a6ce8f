//! Pressure classification against soft thresholds.

use serde::{Deserialize, Serialize};

use super::ResourceMetrics;
use crate::config::ResourceThresholds;

/// Which resource dimensions are above their warning threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureVector {
    pub memory: bool,
    pub cpu: bool,
    pub disk: bool,
    pub network: bool,
    pub overall: bool,
}

impl PressureVector {
    pub fn from_dimensions(memory: bool, cpu: bool, disk: bool, network: bool) -> Self {
        Self {
            memory,
            cpu,
            disk,
            network,
            overall: memory || cpu || disk || network,
        }
    }
}

/// Base classifier: a dimension is under pressure when strictly above its warning threshold.
pub fn classify(metrics: &ResourceMetrics, thresholds: &ResourceThresholds) -> PressureVector {
    PressureVector::from_dimensions(
        metrics.memory_usage > thresholds.memory_warning,
        metrics.cpu_usage > thresholds.cpu_warning,
        metrics.disk_usage > thresholds.disk_warning,
        false,
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalDimensions {
    pub memory: bool,
    pub cpu: bool,
    pub disk: bool,
}

impl CriticalDimensions {
    pub fn any(&self) -> bool {
        self.memory || self.cpu || self.disk
    }
}

pub fn critical_dimensions(
    metrics: &ResourceMetrics,
    thresholds: &ResourceThresholds,
) -> CriticalDimensions {
    CriticalDimensions {
        memory: metrics.memory_usage > thresholds.memory_critical,
        cpu: metrics.cpu_usage > thresholds.cpu_critical,
        disk: metrics.disk_usage > thresholds.disk_critical,
    }
}

/// Stateful classifier with a hysteresis band.
///
/// A raised dimension stays raised until its value drops to `warning - hysteresis`
/// or below. With a zero band this is exactly [`classify`].
#[derive(Debug, Clone)]
pub struct PressureTracker {
    thresholds: ResourceThresholds,
    current: PressureVector,
}

impl PressureTracker {
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self {
            thresholds,
            current: PressureVector::default(),
        }
    }

    pub fn current(&self) -> PressureVector {
        self.current
    }

    pub fn observe(&mut self, metrics: &ResourceMetrics) -> PressureVector {
        let band = self.thresholds.hysteresis.max(0.0);
        let raised = |was: bool, value: f64, warning: f64| {
            if was {
                value > warning - band
            } else {
                value > warning
            }
        };
        let t = &self.thresholds;
        self.current = PressureVector::from_dimensions(
            raised(self.current.memory, metrics.memory_usage, t.memory_warning),
            raised(self.current.cpu, metrics.cpu_usage, t.cpu_warning),
            raised(self.current.disk, metrics.disk_usage, t.disk_warning),
            false,
        );
        self.current
    }
}
