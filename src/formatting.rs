use std::fmt::Write as FmtWrite;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pagegov_lib::{ErrorOutput, GovOutput, GovernorError, PressureVector, PAGEGOV_OUTPUT_VERSION};

use crate::cli::OutputFormat;

/// Write output in the requested format.
pub fn write_output(
    body: &GovOutput,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => write_json_output(body, output.as_deref())?,
        OutputFormat::Pretty => write_pretty_output(body, output.as_deref())?,
    };
    Ok(())
}

/// Render an error and return the fatal exit code.
pub fn render_error(err: GovernorError, format: OutputFormat, output: Option<PathBuf>) -> ExitCode {
    let error_payload = err.to_payload();
    let payload = GovOutput::Error(ErrorOutput {
        version: PAGEGOV_OUTPUT_VERSION.to_string(),
        message: Some(error_payload.message.clone()),
        error: error_payload,
    });

    match format {
        OutputFormat::Json => {
            let content =
                serde_json::to_string(&payload).unwrap_or_else(|_| "{\"mode\":\"error\"}".into());
            if let Some(path) = output {
                if let Err(write_err) = std::fs::write(&path, &content) {
                    eprintln!("Failed to write error output: {}", write_err);
                    println!("{content}");
                }
            } else {
                println!("{content}");
            }
        }
        OutputFormat::Pretty => {
            if let Err(write_err) = write_pretty_output(&payload, output.as_deref()) {
                eprintln!("Failed to write error output: {}", write_err);
            }
        }
    };

    ExitCode::from(2)
}

fn write_json_output(body: &GovOutput, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let content = serde_json::to_string(body)?;
    if let Some(path) = output {
        std::fs::write(path, content)?;
    } else {
        println!("{content}");
    }
    Ok(())
}

fn write_pretty_output(body: &GovOutput, output: Option<&Path>) -> io::Result<()> {
    let use_human = output.is_none() && std::io::stdout().is_terminal();

    if use_human {
        let content = format_pretty(body, true);
        println!("{content}");
        return Ok(());
    }

    // Non-tty or file output: keep JSON shape for pipelines/files.
    let content =
        serde_json::to_string_pretty(body).unwrap_or_else(|_| "{\"mode\":\"error\"}".to_string());
    if let Some(path) = output {
        std::fs::write(path, &content)?;
    } else {
        println!("{content}");
    }
    Ok(())
}

/// Format output for human consumption in a terminal.
pub fn format_pretty(body: &GovOutput, colorize: bool) -> String {
    let ratio = |value: f64, flagged: bool| {
        let text = format!("{:.1}%", value * 100.0);
        color(&text, if flagged { "31" } else { "32" }, colorize)
    };

    match body {
        GovOutput::Probe(out) => {
            let mut buf = String::new();
            let status = if out.pressure.overall {
                color("PRESSURE", "31", colorize)
            } else {
                color("OK", "32", colorize)
            };
            writeln!(buf, "{} Host resources", status).ok();
            writeln!(
                buf,
                "- {:12} {}",
                "memory",
                ratio(out.metrics.memory_usage, out.pressure.memory)
            )
            .ok();
            writeln!(
                buf,
                "- {:12} {}",
                "cpu",
                ratio(out.metrics.cpu_usage, out.pressure.cpu)
            )
            .ok();
            writeln!(
                buf,
                "- {:12} {}",
                "disk",
                ratio(out.metrics.disk_usage, out.pressure.disk)
            )
            .ok();
            let pressured = pressured_dimensions(&out.pressure);
            if !pressured.is_empty() {
                writeln!(buf, "Under pressure: {}", pressured.join(", ")).ok();
            }
            if out.critical.any() {
                writeln!(buf, "{}", color("Critical threshold exceeded", "31", colorize)).ok();
            }
            if out.quota.any() {
                writeln!(buf, "Quota violated: {:?}", out.quota).ok();
            }
            writeln!(buf, "Recommended pool size: {}", out.recommended_pool_size).ok();
            writeln!(buf, "Worker-like processes: {}", out.worker_processes).ok();
            buf
        }
        GovOutput::SweepOrphans(out) => {
            let mut buf = String::new();
            let header = color("[SWEEP]", "36", colorize);
            if out.dry_run {
                writeln!(
                    buf,
                    "{} {} orphaned worker process(es) (dry run)",
                    header,
                    out.processes.len()
                )
                .ok();
                for process in &out.processes {
                    writeln!(buf, "- {:>8} {}", process.pid, process.command_line).ok();
                }
            }
            if let Some(report) = &out.report {
                writeln!(
                    buf,
                    "{} found {}, killed {}, residual {}",
                    header, report.found, report.killed, report.residual
                )
                .ok();
                for error in &report.errors {
                    writeln!(buf, "- {}", color(error, "33", colorize)).ok();
                }
            }
            buf
        }
        GovOutput::CleanTemp(out) => {
            let mut buf = String::new();
            let header = color("[CLEAN]", "34", colorize);
            let mode = if out.aggressive { " (aggressive)" } else { "" };
            writeln!(
                buf,
                "{} removed {} of {} artifact(s), freed {}{}",
                header,
                out.report.removed,
                out.report.scanned,
                human_bytes(out.report.bytes_freed),
                mode
            )
            .ok();
            for dir in &out.directories {
                writeln!(buf, "- {}", dir.display()).ok();
            }
            if out.report.errors > 0 {
                writeln!(buf, "Errors: {}", out.report.errors).ok();
            }
            buf
        }
        GovOutput::Error(out) => {
            let mut buf = String::new();
            let header = color("[ERROR]", "31", colorize);
            let message = out
                .message
                .as_deref()
                .unwrap_or(out.error.message.as_str());
            writeln!(buf, "{} {}", header, message).ok();
            if let Some(remediation) = &out.error.remediation {
                writeln!(buf, "Hint: {}", remediation).ok();
            }
            buf
        }
    }
}

fn pressured_dimensions(pressure: &PressureVector) -> Vec<&'static str> {
    [
        ("memory", pressure.memory),
        ("cpu", pressure.cpu),
        ("disk", pressure.disk),
        ("network", pressure.network),
    ]
    .into_iter()
    .filter_map(|(name, flagged)| flagged.then_some(name))
    .collect()
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Apply ANSI color codes when enabled.
fn color(text: &str, code: &str, colorize: bool) -> String {
    if colorize {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}
