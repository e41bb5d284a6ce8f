use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cleanup::CleanupReport;
use crate::error::ErrorPayload;
use crate::metrics::pressure::{CriticalDimensions, PressureVector};
use crate::metrics::ResourceMetrics;
use crate::quota::QuotaViolations;
use crate::reaper::{ProcessInfo, SweepReport};

/// Schema version for output payloads.
pub const PAGEGOV_OUTPUT_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum GovOutput {
    Probe(ProbeOutput),
    SweepOrphans(SweepOutput),
    CleanTemp(CleanTempOutput),
    Error(ErrorOutput),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutput {
    pub version: String,
    pub metrics: ResourceMetrics,
    pub pressure: PressureVector,
    pub critical: CriticalDimensions,
    pub quota: QuotaViolations,
    pub recommended_pool_size: usize,
    /// Processes on the host matching the worker signature.
    pub worker_processes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutput {
    pub version: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SweepReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanTempOutput {
    pub version: String,
    pub aggressive: bool,
    pub directories: Vec<PathBuf>,
    pub report: CleanupReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutput {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub error: ErrorPayload,
}
