use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{GovernorError, Result};

/// Full governor configuration. Immutable once a [`crate::Governor`] is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    pub sampling: SamplingConfig,
    pub thresholds: ResourceThresholds,
    pub limits: ResourceLimits,
    pub pool: PoolConfig,
    pub lifecycle: LifecycleConfig,
    pub degradation: DegradationConfig,
    pub cleanup: CleanupConfig,
    pub reaper: ReaperConfig,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub history_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub cpu_window: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_capacity: 20,
            cpu_window: Duration::from_millis(50),
        }
    }
}

/// Soft thresholds that drive pressure classification and degradation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceThresholds {
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub disk_warning: f64,
    pub disk_critical: f64,
    /// Width of the band a raised dimension must fall below before it clears.
    pub hysteresis: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 0.75,
            memory_critical: 0.9,
            cpu_warning: 0.7,
            cpu_critical: 0.9,
            disk_warning: 0.8,
            disk_critical: 0.95,
            hysteresis: 0.05,
        }
    }
}

/// Hard administrative ceilings enforced by the quota enforcer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_disk_mb: u64,
    pub max_concurrent_requests: usize,
    pub max_worker_instances: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096,
            max_cpu_percent: 90.0,
            max_disk_mb: 10 * 1024,
            max_concurrent_requests: 10,
            max_worker_instances: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub requests_per_worker: usize,
    /// Memory ratio below which the pool may grow incrementally.
    pub memory_target: f64,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 4,
            requests_per_worker: 2,
            memory_target: 0.7,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    #[serde(with = "humantime_serde")]
    pub max_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_verify_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(30 * 60),
            max_idle: Duration::from_secs(5 * 60),
            close_timeout: Duration::from_secs(5),
            kill_verify_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DegradationConfig {
    pub enabled: bool,
    pub sustained_samples: u32,
    pub recovery_samples: u32,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sustained_samples: 3,
            recovery_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Empty means the system temp directory.
    pub directories: Vec<PathBuf>,
    pub patterns: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    #[serde(with = "humantime_serde")]
    pub pressure_max_age: Duration,
    pub max_file_mb: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            directories: Vec::new(),
            patterns: vec![
                r"^pagegov-profile-".to_string(),
                r"^puppeteer_dev_(chrome_)?profile-".to_string(),
                r"^\.org\.chromium\.Chromium\.".to_string(),
                r"^\.com\.google\.Chrome\.".to_string(),
            ],
            max_age: Duration::from_secs(24 * 60 * 60),
            pressure_max_age: Duration::from_secs(60 * 60),
            max_file_mb: 100,
        }
    }
}

impl CleanupConfig {
    pub fn resolved_directories(&self) -> Vec<PathBuf> {
        if self.directories.is_empty() {
            vec![std::env::temp_dir()]
        } else {
            self.directories.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaperConfig {
    pub executables: Vec<String>,
    pub flags: Vec<String>,
    pub profile_marker: Option<String>,
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            executables: vec![
                "chrome".to_string(),
                "chromium".to_string(),
                "headless_shell".to_string(),
            ],
            flags: vec![
                "--user-data-dir".to_string(),
                "--remote-debugging-port".to_string(),
                "--remote-debugging-pipe".to_string(),
                "--headless".to_string(),
            ],
            profile_marker: None,
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            thresholds: ResourceThresholds::default(),
            limits: ResourceLimits::default(),
            pool: PoolConfig::default(),
            lifecycle: LifecycleConfig::default(),
            degradation: DegradationConfig::default(),
            cleanup: CleanupConfig::default(),
            reaper: ReaperConfig::default(),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

impl GovernorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| GovernorError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load config from a TOML file, the central config, or return defaults.
    /// Priority: explicit path > ~/.config/pagegov/config.toml > defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::central_config_path().filter(|p| p.is_file()),
        };
        let Some(candidate) = candidate else {
            return Ok(Self::new());
        };
        let raw = std::fs::read_to_string(&candidate).map_err(|e| {
            GovernorError::Config(format!(
                "Failed to read config {}: {}",
                candidate.display(),
                e
            ))
        })?;
        toml::from_str(&raw).map_err(|e| {
            GovernorError::Config(format!(
                "Failed to parse config {}: {}",
                candidate.display(),
                e
            ))
        })
    }

    pub fn central_config_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("pagegov")
                .join("config.toml")
        })
    }

    /// Checks every section; all problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let t = &self.thresholds;
        for (name, warning, critical) in [
            ("memory", t.memory_warning, t.memory_critical),
            ("cpu", t.cpu_warning, t.cpu_critical),
            ("disk", t.disk_warning, t.disk_critical),
        ] {
            if !(warning > 0.0 && warning < 1.0) || !(critical > 0.0 && critical < 1.0) {
                problems.push(format!(
                    "thresholds.{name}_warning/{name}_critical must lie in (0, 1)"
                ));
            } else if warning >= critical {
                problems.push(format!(
                    "thresholds.{name}_warning ({warning}) must be below {name}_critical ({critical})"
                ));
            }
        }
        if !(0.0..0.5).contains(&t.hysteresis) {
            problems.push("thresholds.hysteresis must lie in [0, 0.5)".to_string());
        }

        let pool = &self.pool;
        if pool.min_pool_size == 0 || pool.min_pool_size > pool.max_pool_size {
            problems.push(format!(
                "pool sizes must satisfy 1 <= min_pool_size ({}) <= max_pool_size ({})",
                pool.min_pool_size, pool.max_pool_size
            ));
        }
        if pool.requests_per_worker == 0 {
            problems.push("pool.requests_per_worker must be at least 1".to_string());
        }
        if self.limits.max_worker_instances == 0 || self.limits.max_concurrent_requests == 0 {
            problems.push(
                "limits.max_worker_instances and max_concurrent_requests must be at least 1"
                    .to_string(),
            );
        }

        for (name, value) in [
            ("sampling.interval", self.sampling.interval),
            ("lifecycle.cleanup_interval", self.lifecycle.cleanup_interval),
            ("cleanup.interval", self.cleanup.interval),
        ] {
            if value.is_zero() {
                problems.push(format!("{name} must be non-zero"));
            }
        }
        if self.sampling.history_capacity == 0 {
            problems.push("sampling.history_capacity must be at least 1".to_string());
        }

        for pattern in &self.cleanup.patterns {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!("cleanup pattern '{pattern}' is invalid: {e}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GovernorError::Config(problems.join("; ")))
        }
    }
}
