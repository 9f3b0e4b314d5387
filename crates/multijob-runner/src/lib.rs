use anyhow::{Context, Result};
use multijob_core::{enumerate_sweep, BatchId, JobNaming, SweepConfig};
use std::path::PathBuf;
use tracing::info;

mod manifest;
mod script;
mod submit;

pub use manifest::{
    count_lines, prepare_dirs, write_batches, Batch, ManifestPaths, RunLayout,
    DEFAULT_SCRIPT_PREFIX, DEFAULT_THRESHOLD,
};
pub use script::{
    check_directives, declared_array_size, render_script, write_script, ScriptOptions,
};
pub use submit::{submit, submit_log_path, SubmitMode, SubmitOutcome, DEFAULT_SUBMIT_COMMAND};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sweep: SweepConfig,
    pub naming: JobNaming,
    pub layout: RunLayout,
    pub threshold: usize,
    pub script: ScriptOptions,
    pub submit: SubmitMode,
}

pub struct BatchReport {
    pub id: BatchId,
    pub jobs: usize,
    pub manifests: ManifestPaths,
    pub script_path: PathBuf,
    pub submit: SubmitOutcome,
}

pub struct RunReport {
    pub output_dir: PathBuf,
    pub error_dir: PathBuf,
    pub total_jobs: usize,
    pub dry_run: bool,
    pub batches: Vec<BatchReport>,
}

pub fn run_sweep(options: &RunOptions) -> Result<RunReport> {
    options.sweep.validate().context("invalid sweep")?;
    manifest::check_threshold(options.threshold)?;
    check_directives(&options.layout, &options.script)?;

    let points = enumerate_sweep(&options.sweep, options.naming);
    info!(
        jobs = points.len(),
        threshold = options.threshold,
        "enumerated sweep"
    );
    prepare_dirs(&options.layout)?;

    let written = write_batches(&options.layout, &points, options.threshold, BatchId::new)?;
    let mut batches = Vec::with_capacity(written.len());
    for batch in written {
        write_script(&batch, &options.layout, &options.script)?;
        let outcome = submit(&options.submit, &batch.script_path);
        batches.push(BatchReport {
            id: batch.id,
            jobs: batch.points.len(),
            manifests: batch.manifests,
            script_path: batch.script_path,
            submit: outcome,
        });
    }

    Ok(RunReport {
        output_dir: options.layout.output_dir.clone(),
        error_dir: options.layout.error_dir.clone(),
        total_jobs: points.len(),
        dry_run: options.submit.is_dry_run(),
        batches,
    })
}
