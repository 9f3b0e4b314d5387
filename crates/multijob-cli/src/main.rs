use anyhow::{Context, Result};
use clap::Parser;
use multijob_core::{load_sweep_file, JobNaming, SweepConfig};
use multijob_runner::{
    RunLayout, RunOptions, RunReport, ScriptOptions, SubmitMode, SubmitOutcome,
    DEFAULT_SUBMIT_COMMAND, DEFAULT_THRESHOLD,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "multijob",
    version = "0.3.0",
    about = "Generate and submit Slurm job arrays for a seed x env x demos sweep"
)]
struct Cli {
    /// Wall-time per array task, in hours
    #[arg(long, default_value_t = 120)]
    nhrs: u32,
    /// Directory holding the output and error directories (default: cwd)
    #[arg(long = "base_save_dir")]
    base_save_dir: Option<PathBuf>,
    #[arg(long = "output-dirname", default_value = "multijob_iq_output")]
    output_dirname: String,
    #[arg(long = "error-dirname", default_value = "multijob_iq_error")]
    error_dirname: String,
    /// Write manifests and scripts but do not submit
    #[arg(long)]
    dryrun: bool,
    /// Put a random id in every job name instead of NONE
    #[arg(long = "uuid-in-exp-name")]
    uuid_in_exp_name: bool,
    /// Maximum jobs per array submission
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: usize,
    #[arg(long, default_value_t = 1)]
    nodes: u32,
    #[arg(long, default_value_t = 1)]
    ntasks: u32,
    #[arg(long, default_value = "30G")]
    mem: String,
    #[arg(long, default_value = "default_partition")]
    partition: String,
    #[arg(long)]
    no_requeue: bool,
    /// Scheduler submit command, may include arguments
    #[arg(long, default_value = DEFAULT_SUBMIT_COMMAND)]
    submit_cmd: String,
    /// YAML or JSON file overriding the built-in sweep axes
    #[arg(long)]
    sweep: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let json_mode = cli.json;
    match run(cli) {
        Ok(report) => {
            if json_mode {
                emit_json(&json!({
                    "ok": true,
                    "command": "submit",
                    "run": report_to_json(&report),
                }));
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run(cli: Cli) -> Result<RunReport> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    run_in(cli, &cwd)
}

/// Runs the sweep with relative paths resolved against `cwd`.
fn run_in(cli: Cli, cwd: &Path) -> Result<RunReport> {
    let base_dir = match cli.base_save_dir {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    let sweep_path = cli.sweep.map(|p| if p.is_absolute() { p } else { cwd.join(p) });

    let (sweep, setup, exclude) = match &sweep_path {
        Some(path) => {
            let file = load_sweep_file(path)?;
            file.validate()
                .with_context(|| format!("invalid sweep file {}", path.display()))?;
            info!(path = %path.display(), points = file.sweep.point_count(), "loaded sweep file");
            (file.sweep, file.setup, file.exclude)
        }
        None => (SweepConfig::default(), Vec::new(), Vec::new()),
    };

    let options = RunOptions {
        sweep,
        naming: if cli.uuid_in_exp_name {
            JobNaming::Uuid
        } else {
            JobNaming::Placeholder
        },
        layout: RunLayout::new(&base_dir, &cli.output_dirname, &cli.error_dirname),
        threshold: cli.threshold,
        script: ScriptOptions {
            hours: cli.nhrs,
            nodes: cli.nodes,
            ntasks: cli.ntasks,
            mem: cli.mem,
            partition: cli.partition,
            requeue: !cli.no_requeue,
            exclude,
            setup,
            ..ScriptOptions::default()
        },
        submit: if cli.dryrun {
            SubmitMode::DryRun
        } else {
            SubmitMode::scheduler(cli.submit_cmd)
        },
    };
    multijob_runner::run_sweep(&options)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn submit_to_json(outcome: &SubmitOutcome) -> Value {
    match outcome {
        SubmitOutcome::Skipped => json!({ "status": outcome.as_str() }),
        SubmitOutcome::Spawned { pid } => json!({ "status": outcome.as_str(), "pid": pid }),
        SubmitOutcome::Failed { reason } => {
            json!({ "status": outcome.as_str(), "reason": reason })
        }
    }
}

fn report_to_json(report: &RunReport) -> Value {
    let batches: Vec<Value> = report
        .batches
        .iter()
        .map(|b| {
            json!({
                "batch_id": b.id.to_string(),
                "jobs": b.jobs,
                "script": b.script_path.display().to_string(),
                "manifests": {
                    "now": b.manifests.now.display().to_string(),
                    "was": b.manifests.was.display().to_string(),
                    "log": b.manifests.log.display().to_string(),
                    "err": b.manifests.err.display().to_string(),
                },
                "submit": submit_to_json(&b.submit),
            })
        })
        .collect();
    json!({
        "output_dir": report.output_dir.display().to_string(),
        "error_dir": report.error_dir.display().to_string(),
        "total_jobs": report.total_jobs,
        "dry_run": report.dry_run,
        "batches": batches,
    })
}

fn print_report(report: &RunReport) {
    println!("output_dir: {}", report.output_dir.display());
    println!("error_dir: {}", report.error_dir.display());
    println!("total_jobs: {}", report.total_jobs);
    println!("batches: {}", report.batches.len());
    for b in &report.batches {
        println!("batch: {}", b.id);
        println!("  jobs: {}", b.jobs);
        println!("  script: {}", b.script_path.display());
        println!("  commands: {}", b.manifests.now.display());
        match &b.submit {
            SubmitOutcome::Skipped => println!("  submit: skipped (dry run)"),
            SubmitOutcome::Spawned { pid } => println!("  submit: spawned pid {}", pid),
            SubmitOutcome::Failed { reason } => println!("  submit: failed ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_keep_their_original_spelling() {
        let cli = Cli::try_parse_from([
            "multijob",
            "--nhrs",
            "48",
            "--base_save_dir",
            "/scratch/sweeps",
            "--output-dirname",
            "out",
            "--error-dirname",
            "err",
            "--dryrun",
            "--uuid-in-exp-name",
        ])
        .expect("parse");
        assert_eq!(cli.nhrs, 48);
        assert_eq!(cli.base_save_dir, Some(PathBuf::from("/scratch/sweeps")));
        assert_eq!(cli.output_dirname, "out");
        assert_eq!(cli.error_dirname, "err");
        assert!(cli.dryrun);
        assert!(cli.uuid_in_exp_name);
    }

    fn temp_cwd(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "multijob_cli_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&root).expect("temp cwd");
        root
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("multijob").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn dry_run_with_sweep_file_resolves_relative_paths() {
        let cwd = temp_cwd("wiring");
        std::fs::write(
            cwd.join("sweep.yaml"),
            "seeds: [1, 2]\nenvs: [cup_catch]\ndemos: [10]\n\
             setup:\n  - conda activate iq-learn\nexclude: [g2-cpu-01, g2-cpu-02]\n",
        )
        .expect("write sweep");

        let cli = parse(&[
            "--base_save_dir",
            "sweeps",
            "--sweep",
            "sweep.yaml",
            "--dryrun",
            "--nhrs",
            "6",
            "--threshold",
            "1",
        ]);
        let report = run_in(cli, &cwd).expect("run");

        assert!(report.dry_run);
        assert_eq!(report.output_dir, cwd.join("sweeps").join("multijob_iq_output"));
        assert_eq!(report.error_dir, cwd.join("sweeps").join("multijob_iq_error"));
        assert!(report.error_dir.is_dir());
        assert_eq!(report.total_jobs, 2);
        assert_eq!(report.batches.len(), 2);
        for batch in &report.batches {
            assert_eq!(batch.submit, SubmitOutcome::Skipped);
            let body = std::fs::read_to_string(&batch.script_path).expect("script");
            assert!(body.contains("#SBATCH --array=1-1\n"));
            assert!(body.contains("#SBATCH -t 6:00:00\n"));
            assert!(body.contains("#SBATCH --exclude=g2-cpu-01,g2-cpu-02\n"));
            assert!(body.contains("\nconda activate iq-learn\nsrun "));
            assert!(!multijob_runner::submit_log_path(&batch.script_path).exists());
        }
        let _ = std::fs::remove_dir_all(cwd);
    }

    #[test]
    fn sweep_file_with_line_break_in_setup_is_rejected() {
        let cwd = temp_cwd("badsetup");
        std::fs::write(cwd.join("sweep.json"), r#"{"setup": ["cd /work\nrm -rf x"]}"#)
            .expect("write sweep");
        let cli = parse(&["--sweep", "sweep.json", "--dryrun"]);
        let err = match run_in(cli, &cwd) {
            Ok(_) => panic!("line break in setup must fail"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("setup"), "{:#}", err);
        assert!(!cwd.join("multijob_iq_output").exists());
        let _ = std::fs::remove_dir_all(cwd);
    }

    #[test]
    fn report_json_lists_batches_and_submit_status() {
        let cwd = temp_cwd("json");
        let cli = parse(&["--dryrun", "--threshold", "10"]);
        let report = run_in(cli, &cwd).expect("run");
        let value = report_to_json(&report);

        assert_eq!(value["total_jobs"], 15);
        assert_eq!(value["dry_run"], true);
        assert_eq!(
            value["output_dir"],
            cwd.join("multijob_iq_output").display().to_string()
        );
        let batches = value["batches"].as_array().expect("batches");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0]["jobs"], 10);
        assert_eq!(batches[1]["jobs"], 5);
        for (b, json_b) in report.batches.iter().zip(batches) {
            assert_eq!(json_b["batch_id"], b.id.to_string());
            assert_eq!(json_b["script"], b.script_path.display().to_string());
            for key in ["now", "was", "log", "err"] {
                assert!(json_b["manifests"][key].is_string(), "missing manifest {}", key);
            }
            assert_eq!(json_b["submit"], json!({ "status": "skipped" }));
        }

        assert_eq!(
            submit_to_json(&SubmitOutcome::Spawned { pid: 42 }),
            json!({ "status": "spawned", "pid": 42 })
        );
        assert_eq!(
            submit_to_json(&SubmitOutcome::Failed {
                reason: "not found".to_string()
            }),
            json!({ "status": "failed", "reason": "not found" })
        );
        let _ = std::fs::remove_dir_all(cwd);
    }

    #[test]
    fn defaults_match_the_batch_script() {
        let cli = Cli::try_parse_from(["multijob"]).expect("parse");
        assert_eq!(cli.nhrs, 120);
        assert_eq!(cli.threshold, 999);
        assert_eq!(cli.output_dirname, "multijob_iq_output");
        assert_eq!(cli.error_dirname, "multijob_iq_error");
        assert_eq!(cli.submit_cmd, "sbatch");
        assert!(!cli.dryrun);
        assert!(!cli.no_requeue);
    }
}
