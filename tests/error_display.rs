use pagegov_lib::error::ErrorCategory;
use pagegov_lib::GovernorError;

#[test]
fn config_error_display_includes_message() {
    let err = GovernorError::Config("missing [pool] section".to_string());

    assert_eq!(
        format!("{}", err),
        "Configuration error: missing [pool] section"
    );
}

#[test]
fn io_error_display_wraps_source() {
    let io_err = std::io::Error::other("disk full");
    let err: GovernorError = io_err.into();
    let rendered = format!("{}", err);

    assert!(rendered.starts_with("IO error: "));
    assert!(rendered.contains("disk full"));
}

#[test]
fn worker_helper_uses_message() {
    let err = GovernorError::worker("target closed");

    assert_eq!(format!("{}", err), "Worker error: target closed");
}

#[test]
fn capacity_helper_is_a_rejection() {
    let err = GovernorError::capacity("10 requests in flight (limit 10)");

    assert_eq!(
        format!("{}", err),
        "Capacity exceeded: 10 requests in flight (limit 10)"
    );
    assert!(err.is_capacity_rejection());
    assert!(GovernorError::ShuttingDown.is_capacity_rejection());
    assert!(!GovernorError::Spawn("x".into()).is_capacity_rejection());
}

#[test]
fn payload_categories_follow_variants() {
    let cases = [
        (GovernorError::Config("x".into()), ErrorCategory::Config),
        (GovernorError::capacity("x"), ErrorCategory::Capacity),
        (GovernorError::Timeout("x".into()), ErrorCategory::Capacity),
        (GovernorError::ShuttingDown, ErrorCategory::Capacity),
        (GovernorError::Spawn("x".into()), ErrorCategory::Worker),
        (GovernorError::worker("x"), ErrorCategory::Worker),
        (GovernorError::Process("x".into()), ErrorCategory::Process),
        (
            GovernorError::Io(std::io::Error::other("x")),
            ErrorCategory::Io,
        ),
    ];
    for (err, category) in cases {
        let payload = err.to_payload();
        assert_eq!(payload.category, category, "category for {err}");
        assert!(payload.remediation.is_some());
    }
}

#[test]
fn payload_serializes_camel_case() {
    let payload = GovernorError::ShuttingDown.to_payload();
    let json = serde_json::to_string(&payload).expect("serialize payload");
    assert!(json.contains("\"category\":\"capacity\""));
    assert!(json.contains("\"message\":\"Governor is shutting down\""));
    assert!(json.contains("\"remediation\""));
}
