use std::path::{Path, PathBuf};

use pagegov_lib::{GovernorConfig, GovernorError};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "PAGEGOV_LOG";

/// Install the stderr tracing subscriber. `--verbose` wins over `PAGEGOV_LOG`.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Load config from a TOML file, central config, or return defaults.
/// Priority: explicit path > ~/.config/pagegov/config.toml > defaults
pub fn load_config(path: Option<&Path>) -> Result<GovernorConfig, GovernorError> {
    let cfg = GovernorConfig::load(path)?;

    cfg.validate().map_err(|e| {
        let detail = match e {
            GovernorError::Config(message) => message,
            other => other.to_string(),
        };
        let prefix = path
            .map(|p| format!("Invalid config ({}): {}", p.display(), detail))
            .unwrap_or_else(|| format!("Invalid config: {}", detail));
        GovernorError::Config(prefix)
    })?;
    Ok(cfg)
}

/// Apply `clean-temp` overrides on top of the loaded config.
pub fn with_cleanup_dirs(mut config: GovernorConfig, dirs: Vec<PathBuf>) -> GovernorConfig {
    if !dirs.is_empty() {
        config.cleanup.directories = dirs;
    }
    config
}

/// Apply `sweep-orphans` overrides on top of the loaded config.
pub fn with_profile_marker(mut config: GovernorConfig, marker: Option<String>) -> GovernorConfig {
    if marker.is_some() {
        config.reaper.profile_marker = marker;
    }
    config
}

/// Format effective config as a single-line string.
pub fn format_effective_config(config: &GovernorConfig, config_source: Option<&Path>) -> String {
    let source = config_source
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    let t = &config.thresholds;
    let l = &config.limits;
    format!(
        "Effective config [{source}]: warning mem={:.2} cpu={:.2} disk={:.2}, critical mem={:.2} cpu={:.2} disk={:.2}, limits: memory={}MB, cpu={:.0}%, requests={}, workers={}, pool={}..{}",
        t.memory_warning,
        t.cpu_warning,
        t.disk_warning,
        t.memory_critical,
        t.cpu_critical,
        t.disk_critical,
        l.max_memory_mb,
        l.max_cpu_percent,
        l.max_concurrent_requests,
        l.max_worker_instances,
        config.pool.min_pool_size,
        config.pool.max_pool_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_reports_path_on_parse_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool\nmin_pool_size = 1").unwrap();

        let err = load_config(Some(file.path())).unwrap_err();
        let rendered = err.to_string();
        let path = file.path().display().to_string();
        assert!(rendered.starts_with("Configuration error: Failed to parse config "));
        assert!(rendered.contains(&path));
        assert_eq!(rendered.matches("Configuration error").count(), 1);
        assert_eq!(rendered.matches(path.as_str()).count(), 1);
    }

    #[test]
    fn load_config_reports_missing_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        let rendered = load_config(Some(&missing)).unwrap_err().to_string();
        assert!(rendered.starts_with("Configuration error: Failed to read config "));
        assert_eq!(rendered.matches("Failed to read config").count(), 1);
    }

    #[test]
    fn load_config_prefixes_validation_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_pool_size = 5\nmax_pool_size = 2").unwrap();

        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, GovernorError::Config(ref m) if m.starts_with("Invalid config (")));
        assert_eq!(err.to_string().matches("Configuration error").count(), 1);
    }

    #[test]
    fn overrides_only_apply_when_given() {
        let base = GovernorConfig::new();
        let same = with_cleanup_dirs(base.clone(), Vec::new());
        assert_eq!(same.cleanup.directories, base.cleanup.directories);

        let moved = with_cleanup_dirs(base.clone(), vec![PathBuf::from("/scratch")]);
        assert_eq!(moved.cleanup.directories, vec![PathBuf::from("/scratch")]);

        let marked = with_profile_marker(base, Some("job-42".to_string()));
        assert_eq!(marked.reaper.profile_marker.as_deref(), Some("job-42"));
    }

    #[test]
    fn format_effective_config_includes_limits() {
        let summary =
            format_effective_config(&GovernorConfig::new(), Some(Path::new("pagegov.toml")));
        assert!(summary.contains("memory=4096MB"));
        assert!(summary.contains("requests=10"));
        assert!(summary.contains("pool=1..4"));
        assert!(summary.contains("pagegov.toml"));
    }
}
