use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker spawn failed: {0}")]
    Spawn(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Process inspection error: {0}")]
    Process(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Governor is shutting down")]
    ShuttingDown,
}

impl GovernorError {
    pub fn worker(message: impl Into<String>) -> Self {
        GovernorError::Worker(message.into())
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        GovernorError::CapacityExceeded(message.into())
    }

    /// True for errors a caller should treat as "try again later" rather than a fault.
    pub fn is_capacity_rejection(&self) -> bool {
        matches!(
            self,
            GovernorError::CapacityExceeded(_) | GovernorError::ShuttingDown
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            GovernorError::Io(e) => ErrorPayload::new(
                ErrorCategory::Io,
                e.to_string(),
                "Check file paths/permissions for the temp and profile directories.",
            ),
            GovernorError::Serialization(e) => ErrorPayload::new(
                ErrorCategory::Io,
                e.to_string(),
                "Re-run with --verbose for details.",
            ),
            GovernorError::Config(msg) => {
                let lower = msg.to_ascii_lowercase();
                if lower.contains("warning") && lower.contains("critical") {
                    ErrorPayload::new(
                        ErrorCategory::Config,
                        msg.to_string(),
                        "Keep every *_warning threshold strictly below its *_critical counterpart.",
                    )
                } else if lower.contains("pattern") {
                    ErrorPayload::new(
                        ErrorCategory::Config,
                        msg.to_string(),
                        "Fix the [cleanup] patterns; each entry must be a valid regular expression.",
                    )
                } else if lower.contains("pool") {
                    ErrorPayload::new(
                        ErrorCategory::Config,
                        msg.to_string(),
                        "Ensure 1 <= min_pool_size <= max_pool_size in the [pool] section.",
                    )
                } else {
                    ErrorPayload::new(
                        ErrorCategory::Config,
                        msg.to_string(),
                        "Check the config file (TOML) and durations such as \"30s\" or \"5m\".",
                    )
                }
            }
            GovernorError::Spawn(msg) => {
                let lower = msg.to_ascii_lowercase();
                if lower.contains("not found") {
                    ErrorPayload::new(
                        ErrorCategory::Worker,
                        msg.to_string(),
                        "Install the rendering engine or point the worker program at its binary.",
                    )
                } else {
                    ErrorPayload::new(
                        ErrorCategory::Worker,
                        msg.to_string(),
                        "Check host memory and process limits; run `pagegov sweep-orphans` to reclaim leaked workers.",
                    )
                }
            }
            GovernorError::Worker(msg) => ErrorPayload::new(
                ErrorCategory::Worker,
                msg.to_string(),
                "The worker is dismissed automatically; retry the request.",
            ),
            GovernorError::Process(msg) => ErrorPayload::new(
                ErrorCategory::Process,
                msg.to_string(),
                "Check that the process table is readable (permissions, /proc mount).",
            ),
            GovernorError::CapacityExceeded(msg) => ErrorPayload::new(
                ErrorCategory::Capacity,
                msg.to_string(),
                "Retry after a short delay or raise [limits] max_concurrent_requests.",
            ),
            GovernorError::Timeout(msg) => ErrorPayload::new(
                ErrorCategory::Capacity,
                msg.to_string(),
                "Increase the relevant timeout or reduce load.",
            ),
            GovernorError::ShuttingDown => ErrorPayload::new(
                ErrorCategory::Capacity,
                self.to_string(),
                "The governor no longer admits work; start a new instance.",
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, GovernorError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Capacity,
    Worker,
    Process,
    Io,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl ErrorPayload {
    pub fn new(category: ErrorCategory, message: String, remediation: impl Into<String>) -> Self {
        Self {
            category,
            message,
            remediation: Some(remediation.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_payload_mentions_threshold_ordering() {
        let err = GovernorError::Config(
            "thresholds.memory_warning (0.9) must be below memory_critical (0.8)".to_string(),
        );
        let payload = err.to_payload();
        assert_eq!(payload.category, ErrorCategory::Config);
        let remediation = payload.remediation.unwrap_or_default();
        assert!(
            remediation.contains("strictly below"),
            "expected threshold remediation, got: {remediation}"
        );
    }

    #[test]
    fn config_payload_uses_default_remediation_for_other_messages() {
        let err = GovernorError::Config("Some other config issue".to_string());
        let remediation = err.to_payload().remediation.unwrap_or_default();
        assert!(remediation.contains("TOML"));
    }

    #[test]
    fn spawn_not_found_points_at_engine_install() {
        let err = GovernorError::Spawn("program 'chromium' not found on PATH".to_string());
        let remediation = err.to_payload().remediation.unwrap_or_default();
        assert!(
            remediation.to_ascii_lowercase().contains("install"),
            "expected install hint, got: {remediation}"
        );
    }

    #[test]
    fn capacity_errors_are_rejections() {
        assert!(GovernorError::capacity("pool full").is_capacity_rejection());
        assert!(GovernorError::ShuttingDown.is_capacity_rejection());
        assert!(!GovernorError::worker("close failed").is_capacity_rejection());
        assert_eq!(
            GovernorError::capacity("pool full").to_payload().category,
            ErrorCategory::Capacity
        );
    }
}
