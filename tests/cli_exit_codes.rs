use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, SystemTime};

use pagegov_lib::error::ErrorCategory;
use pagegov_lib::GovOutput;
use tempfile::TempDir;

fn bin_path() -> PathBuf {
    std::env::var("CARGO_BIN_EXE_pagegov")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("target")
                .join("debug")
                .join(if cfg!(windows) { "pagegov.exe" } else { "pagegov" })
        })
}

/// Runs with HOME pointed at `home` so a developer's central config is never picked up.
fn run_cmd(home: &Path, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("HOME", home)
        .env_remove("PAGEGOV_LOG")
        .output()
        .expect("run pagegov command")
}

fn parse_json(stdout: &[u8]) -> GovOutput {
    serde_json::from_slice(stdout).expect("output should be valid JSON")
}

fn backdate(path: &Path, by: Duration) {
    let file = if path.is_dir() {
        std::fs::File::open(path)
    } else {
        std::fs::File::options().write(true).open(path)
    };
    file.expect("open for mtime")
        .set_modified(SystemTime::now() - by)
        .expect("set mtime");
}

#[test]
fn probe_exits_zero_with_probe_payload() {
    let home = TempDir::new().expect("tempdir");
    let output = run_cmd(home.path(), &["probe", "--active-requests", "3"]);

    assert_eq!(output.status.code(), Some(0));
    match parse_json(&output.stdout) {
        GovOutput::Probe(out) => {
            assert_eq!(out.metrics.active_requests, 3);
            assert!((0.0..=1.0).contains(&out.metrics.memory_usage));
            assert!(out.recommended_pool_size >= 1);
            assert!(out.recommended_pool_size <= 4);
        }
        other => panic!("expected probe output, got {:?}", other),
    }
}

#[test]
fn invalid_config_exits_with_fatal_code_and_error_payload() {
    let home = TempDir::new().expect("tempdir");
    let cfg_path = home.path().join("pagegov.toml");
    std::fs::write(
        &cfg_path,
        "[thresholds]\nmemory_warning = 0.95\nmemory_critical = 0.9\n",
    )
    .expect("write config");

    let output = run_cmd(
        home.path(),
        &["--config", cfg_path.to_str().unwrap(), "probe"],
    );

    assert_eq!(output.status.code(), Some(2));
    match parse_json(&output.stdout) {
        GovOutput::Error(out) => {
            assert_eq!(out.error.category, ErrorCategory::Config);
            assert!(out.error.message.contains("Invalid config"));
            assert!(out.error.remediation.is_some());
        }
        other => panic!("expected error output, got {:?}", other),
    }
}

#[test]
fn missing_config_file_is_fatal() {
    let home = TempDir::new().expect("tempdir");
    let output = run_cmd(
        home.path(),
        &["clean-temp", "--config", "/definitely/not/here.toml"],
    );
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn clean_temp_removes_stale_profiles_only() {
    let home = TempDir::new().expect("tempdir");
    let scratch = TempDir::new().expect("tempdir");
    let stale = scratch.path().join("pagegov-profile-1-0");
    let fresh = scratch.path().join("pagegov-profile-1-1");
    let unrelated = scratch.path().join("notes.txt");
    for dir in [&stale, &fresh] {
        std::fs::create_dir(dir).expect("mkdir");
        std::fs::write(dir.join("Preferences"), b"{}").expect("write");
    }
    std::fs::write(&unrelated, b"keep").expect("write");
    backdate(&stale, Duration::from_secs(48 * 60 * 60));
    backdate(&unrelated, Duration::from_secs(48 * 60 * 60));

    let output = run_cmd(
        home.path(),
        &["clean-temp", "--dir", scratch.path().to_str().unwrap()],
    );

    assert_eq!(output.status.code(), Some(0));
    match parse_json(&output.stdout) {
        GovOutput::CleanTemp(out) => {
            assert!(!out.aggressive);
            assert_eq!(out.report.scanned, 2);
            assert_eq!(out.report.removed, 1);
            assert_eq!(out.report.errors, 0);
        }
        other => panic!("expected clean-temp output, got {:?}", other),
    }
    assert!(!stale.exists());
    assert!(fresh.exists());
    assert!(unrelated.exists());
}

#[test]
fn sweep_with_unmatched_marker_finds_nothing() {
    let home = TempDir::new().expect("tempdir");
    let output = run_cmd(
        home.path(),
        &[
            "sweep-orphans",
            "--profile-marker",
            "no-such-profile-3f9c1e",
        ],
    );

    assert_eq!(output.status.code(), Some(0));
    match parse_json(&output.stdout) {
        GovOutput::SweepOrphans(out) => {
            assert!(!out.dry_run);
            let report = out.report.expect("sweep report");
            assert_eq!(report.found, 0);
            assert_eq!(report.killed, 0);
        }
        other => panic!("expected sweep output, got {:?}", other),
    }
}

#[test]
fn dry_run_sweep_never_reports_kills() {
    let home = TempDir::new().expect("tempdir");
    let output = run_cmd(home.path(), &["sweep-orphans", "--dry-run"]);

    assert_eq!(output.status.code(), Some(0));
    match parse_json(&output.stdout) {
        GovOutput::SweepOrphans(out) => {
            assert!(out.dry_run);
            assert!(out.report.is_none());
        }
        other => panic!("expected sweep output, got {:?}", other),
    }
}

#[test]
fn pretty_format_to_file_keeps_json_shape() {
    let home = TempDir::new().expect("tempdir");
    let scratch = TempDir::new().expect("tempdir");
    let out_path = home.path().join("report.json");

    let output = run_cmd(
        home.path(),
        &[
            "clean-temp",
            "--dir",
            scratch.path().to_str().unwrap(),
            "--format",
            "pretty",
            "--output",
            out_path.to_str().unwrap(),
        ],
    );

    assert_eq!(output.status.code(), Some(0));
    let written = std::fs::read(&out_path).expect("read report");
    assert!(matches!(parse_json(&written), GovOutput::CleanTemp(_)));
}
