use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use pagegov_lib::{
    GovOutput, GovernorError, OrphanReaper, SweepOutput, SysinfoInspector, PAGEGOV_OUTPUT_VERSION,
};
use tracing::info;

use crate::cli::OutputFormat;
use crate::formatting::{render_error, write_output};
use crate::settings::{load_config, with_profile_marker};

/// Run the sweep-orphans command.
pub async fn run_sweep_orphans(
    config_path: Option<PathBuf>,
    dry_run: bool,
    profile_marker: Option<String>,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> ExitCode {
    let config = match load_config(config_path.as_deref()) {
        Ok(cfg) => with_profile_marker(cfg, profile_marker),
        Err(err) => return render_error(err, format, output),
    };
    let reaper = OrphanReaper::new(Arc::new(SysinfoInspector::new()), &config.reaper);

    let body = if dry_run {
        let processes = match reaper.scan().await {
            Ok(found) => found,
            Err(err) => return render_error(err, format, output),
        };
        info!(count = processes.len(), "dry run; nothing killed");
        SweepOutput {
            version: PAGEGOV_OUTPUT_VERSION.to_string(),
            dry_run,
            processes,
            report: None,
        }
    } else {
        SweepOutput {
            version: PAGEGOV_OUTPUT_VERSION.to_string(),
            dry_run,
            processes: Vec::new(),
            report: Some(reaper.sweep().await),
        }
    };

    if let Err(err) = write_output(&GovOutput::SweepOrphans(body), format, output.clone()) {
        return render_error(GovernorError::Config(err.to_string()), format, output);
    }
    ExitCode::SUCCESS
}
