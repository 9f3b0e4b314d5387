use crate::manifest::{Batch, RunLayout};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use multijob_core::ensure_dir;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Resource requests and per-task environment for generated job-array scripts.
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    pub hours: u32,
    pub nodes: u32,
    pub ntasks: u32,
    pub mem: String,
    pub partition: String,
    pub requeue: bool,
    /// `#SBATCH -o` pattern; defaults to `<output_dir>/<prefix>_%j.out`.
    pub scheduler_output: Option<String>,
    /// `#SBATCH -e` pattern; defaults to `<error_dir>/<prefix>_%j.err`.
    pub scheduler_error: Option<String>,
    pub exclude: Vec<String>,
    pub setup: Vec<String>,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            hours: 120,
            nodes: 1,
            ntasks: 1,
            mem: "30G".to_string(),
            partition: "default_partition".to_string(),
            requeue: true,
            scheduler_output: None,
            scheduler_error: None,
            exclude: Vec::new(),
            setup: Vec::new(),
        }
    }
}

fn scheduler_log_patterns(layout: &RunLayout, options: &ScriptOptions) -> (String, String) {
    let out = options.scheduler_output.clone().unwrap_or_else(|| {
        layout
            .output_dir
            .join(format!("{}_%j.out", layout.script_prefix))
            .display()
            .to_string()
    });
    let err = options.scheduler_error.clone().unwrap_or_else(|| {
        layout
            .error_dir
            .join(format!("{}_%j.err", layout.script_prefix))
            .display()
            .to_string()
    });
    (out, err)
}

/// `#SBATCH` lines are not shell-parsed, so the `-o`/`-e` patterns cannot be quoted.
pub fn check_directives(layout: &RunLayout, options: &ScriptOptions) -> Result<()> {
    let (out, err) = scheduler_log_patterns(layout, options);
    for (flag, pattern) in [("-o", &out), ("-e", &err)] {
        if pattern.is_empty() || pattern.chars().any(char::is_whitespace) {
            return Err(anyhow!(
                "scheduler log path for #SBATCH {} must be non-empty without whitespace: {:?}",
                flag,
                pattern
            ));
        }
    }
    Ok(())
}

pub fn render_script(batch: &Batch, layout: &RunLayout, options: &ScriptOptions) -> String {
    let (sched_out, sched_err) = scheduler_log_patterns(layout, options);

    // Writing into a String cannot fail.
    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/bash");
    let _ = writeln!(s, "#SBATCH --array=1-{}", batch.points.len());
    let _ = writeln!(s, "#SBATCH -o {}", sched_out);
    let _ = writeln!(s, "#SBATCH -e {}", sched_err);
    if options.requeue {
        let _ = writeln!(s, "#SBATCH --requeue");
    }
    let _ = writeln!(s, "#SBATCH -t {}:00:00", options.hours);
    let _ = writeln!(s, "#SBATCH -N {}", options.nodes);
    let _ = writeln!(s, "#SBATCH -n {}", options.ntasks);
    let _ = writeln!(s, "#SBATCH --mem={}", options.mem);
    let _ = writeln!(s, "#SBATCH --partition={}", options.partition);
    if !options.exclude.is_empty() {
        let _ = writeln!(s, "#SBATCH --exclude={}", options.exclude.join(","));
    }
    s.push('\n');
    for line in &options.setup {
        let _ = writeln!(s, "{}", line);
    }
    let _ = writeln!(
        s,
        "srun --output={} --error={} {}",
        task_line(&batch.manifests.log),
        task_line(&batch.manifests.err),
        task_line(&batch.manifests.now)
    );
    s
}

fn task_line(manifest: &Path) -> String {
    format!(
        "$(head -n $SLURM_ARRAY_TASK_ID {} | tail -n 1)",
        shell_quote(&manifest.to_string_lossy())
    )
}

pub fn write_script(batch: &Batch, layout: &RunLayout, options: &ScriptOptions) -> Result<()> {
    check_directives(layout, options)?;
    let body = render_script(batch, layout, options);
    atomic_write_bytes(&batch.script_path, body.as_bytes())
        .with_context(|| format!("write script {}", batch.script_path.display()))?;
    info!(
        batch = %batch.id,
        jobs = batch.points.len(),
        script = %batch.script_path.display(),
        "wrote submission script"
    );
    Ok(())
}

/// Reads `#SBATCH --array=1-N` back out of a generated script.
pub fn declared_array_size(script: &str) -> Option<usize> {
    script
        .lines()
        .find_map(|l| l.strip_prefix("#SBATCH --array=1-"))
        .and_then(|n| n.trim().parse().ok())
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("script");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
