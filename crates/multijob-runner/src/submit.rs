use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

pub const DEFAULT_SUBMIT_COMMAND: &str = "sbatch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitMode {
    /// Run `<command> <script>`; `command` may carry extra arguments, e.g. `sbatch --parsable`.
    Scheduler { command: String },
    DryRun,
}

impl SubmitMode {
    pub fn scheduler(command: impl Into<String>) -> Self {
        SubmitMode::Scheduler {
            command: command.into(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, SubmitMode::DryRun)
    }
}

impl Default for SubmitMode {
    fn default() -> Self {
        SubmitMode::scheduler(DEFAULT_SUBMIT_COMMAND)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Skipped,
    Spawned { pid: u32 },
    Failed { reason: String },
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Skipped => "skipped",
            SubmitOutcome::Spawned { .. } => "spawned",
            SubmitOutcome::Failed { .. } => "failed",
        }
    }
}

/// File next to `script` that receives the scheduler's stdout (e.g. `Submitted batch job N`).
pub fn submit_log_path(script: &Path) -> PathBuf {
    let mut name = script.as_os_str().to_owned();
    name.push(".submit.log");
    PathBuf::from(name)
}

// The parent's stdout carries the run report, so the child must never write to it.
fn child_stdout(script: &Path) -> Stdio {
    let log = submit_log_path(script);
    match File::create(&log) {
        Ok(file) => Stdio::from(file),
        Err(e) => {
            warn!(
                path = %log.display(),
                error = %e,
                "cannot create submit log, discarding scheduler output"
            );
            Stdio::null()
        }
    }
}

/// Hands `script` to the scheduler without waiting for it. Failures are reported, never raised.
pub fn submit(mode: &SubmitMode, script: &Path) -> SubmitOutcome {
    let command = match mode {
        SubmitMode::DryRun => {
            info!(script = %script.display(), "dry run, not submitting");
            return SubmitOutcome::Skipped;
        }
        SubmitMode::Scheduler { command } => command,
    };
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        warn!("empty submit command");
        return SubmitOutcome::Failed {
            reason: "empty submit command".to_string(),
        };
    };
    let mut cmd = Command::new(program);
    cmd.args(parts)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(child_stdout(script));
    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id();
            info!(%program, pid, script = %script.display(), "submitted");
            SubmitOutcome::Spawned { pid }
        }
        Err(e) => {
            warn!(%program, script = %script.display(), error = %e, "submission failed");
            SubmitOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}
