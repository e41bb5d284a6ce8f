use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use pagegov_lib::metrics::pressure::critical_dimensions;
use pagegov_lib::quota;
use pagegov_lib::{
    classify, GovOutput, GovernorError, MetricsSampler, OrphanReaper, PoolSizeOptimizer, ProbeOutput,
    SysinfoInspector, SysinfoProbe, PAGEGOV_OUTPUT_VERSION,
};
use tracing::{debug, warn};

use crate::cli::OutputFormat;
use crate::formatting::{render_error, write_output};
use crate::settings::{format_effective_config, load_config};

/// Run the probe command.
pub async fn run_probe(
    config_path: Option<PathBuf>,
    active_requests: usize,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> ExitCode {
    let config = match load_config(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => return render_error(err, format, output),
    };
    debug!("{}", format_effective_config(&config, config_path.as_deref()));

    let disk_path = config
        .cleanup
        .resolved_directories()
        .into_iter()
        .next()
        .unwrap_or_else(std::env::temp_dir);
    let mut sampler = MetricsSampler::new(
        Box::new(SysinfoProbe::for_path(disk_path)),
        &config.sampling,
    );
    let reaper = OrphanReaper::new(Arc::new(SysinfoInspector::new()), &config.reaper);
    let worker_pids: Vec<u32> = match reaper.scan().await {
        Ok(found) => found.into_iter().map(|p| p.pid).collect(),
        Err(err) => {
            warn!(error = %err, "process scan failed");
            Vec::new()
        }
    };
    let worker_processes = worker_pids.len();
    // No pool is owned here; the engine processes on the host only count
    // towards the memory footprint.
    let metrics = sampler.sample(0, active_requests, &worker_pids).await;

    let recommended_pool_size = PoolSizeOptimizer::new(config.pool.clone())
        .optimal(&metrics)
        .min(config.limits.max_worker_instances);

    let body = GovOutput::Probe(ProbeOutput {
        version: PAGEGOV_OUTPUT_VERSION.to_string(),
        pressure: classify(&metrics, &config.thresholds),
        critical: critical_dimensions(&metrics, &config.thresholds),
        quota: quota::check(&metrics, &config.limits),
        recommended_pool_size,
        worker_processes,
        metrics,
    });
    if let Err(err) = write_output(&body, format, output.clone()) {
        return render_error(GovernorError::Config(err.to_string()), format, output);
    }
    ExitCode::SUCCESS
}
