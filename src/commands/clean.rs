use std::path::PathBuf;
use std::process::ExitCode;

use pagegov_lib::{
    CleanTempOutput, CleanupScheduler, EventBus, GovOutput, GovernorError, PAGEGOV_OUTPUT_VERSION,
};

use crate::cli::OutputFormat;
use crate::formatting::{render_error, write_output};
use crate::settings::{load_config, with_cleanup_dirs};

/// Run the clean-temp command.
pub async fn run_clean_temp(
    config_path: Option<PathBuf>,
    aggressive: bool,
    directories: Vec<PathBuf>,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> ExitCode {
    let config = match load_config(config_path.as_deref()) {
        Ok(cfg) => with_cleanup_dirs(cfg, directories),
        Err(err) => return render_error(err, format, output),
    };
    let scheduler = match CleanupScheduler::new(&config.cleanup, &config.limits, EventBus::default())
    {
        Ok(scheduler) => scheduler,
        Err(err) => return render_error(err, format, output),
    };

    let report = scheduler.run(aggressive).await;
    let body = GovOutput::CleanTemp(CleanTempOutput {
        version: PAGEGOV_OUTPUT_VERSION.to_string(),
        aggressive,
        directories: scheduler.directories().to_vec(),
        report,
    });
    if let Err(err) = write_output(&body, format, output.clone()) {
        return render_error(GovernorError::Config(err.to_string()), format, output);
    }
    ExitCode::SUCCESS
}
