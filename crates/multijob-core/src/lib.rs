use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PROGRAM: &str = "python train_iq.py";
pub const DEFAULT_JOB_PREFIX: &str = "iq_learn";
pub const NAME_PLACEHOLDER: &str = "NONE";

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep axis `{0}` is empty")]
    EmptyAxis(&'static str),
    #[error("sweep program cannot be empty")]
    EmptyProgram,
    #[error("`{field}` value {value:?} contains a line break")]
    LineBreak { field: &'static str, value: String },
    #[error("failed to read sweep file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse sweep file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LossMode {
    Value,
    V0,
}

impl LossMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LossMode::Value => "value",
            LossMode::V0 => "v0",
        }
    }
}

impl fmt::Display for LossMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the trailing `id_<...>` component of a job name is filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobNaming {
    #[default]
    Placeholder,
    Uuid,
}

impl JobNaming {
    fn next_id(self) -> String {
        match self {
            JobNaming::Placeholder => NAME_PLACEHOLDER.to_string(),
            JobNaming::Uuid => Uuid::new_v4().to_string(),
        }
    }
}

/// Axes of the sweep plus the rules used to derive per-point arguments.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub seeds: Vec<i64>,
    #[serde(alias = "envs")]
    pub environments: Vec<String>,
    pub demos: Vec<u32>,
    pub program: String,
    pub job_prefix: String,
    pub extra_args: Vec<String>,
    pub value_loss_envs: Vec<String>,
    pub high_temp_envs: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            seeds: vec![1, 100, 1000],
            environments: [
                "cheetah_run",
                "walker_walk",
                "quadruped_walk",
                "cup_catch",
                "humanoid_stand",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            demos: vec![10],
            program: DEFAULT_PROGRAM.to_string(),
            job_prefix: DEFAULT_JOB_PREFIX.to_string(),
            extra_args: Vec::new(),
            value_loss_envs: vec!["cheetah_run".to_string(), "cup_catch".to_string()],
            high_temp_envs: vec!["humanoid_stand".to_string()],
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.seeds.is_empty() {
            return Err(SweepError::EmptyAxis("seeds"));
        }
        if self.environments.is_empty() {
            return Err(SweepError::EmptyAxis("environments"));
        }
        if self.demos.is_empty() {
            return Err(SweepError::EmptyAxis("demos"));
        }
        if self.program.trim().is_empty() {
            return Err(SweepError::EmptyProgram);
        }
        // Each job is one manifest line; an embedded newline would shift every later task.
        reject_line_breaks("program", [&self.program])?;
        reject_line_breaks("job_prefix", [&self.job_prefix])?;
        reject_line_breaks("environments", &self.environments)?;
        reject_line_breaks("extra_args", &self.extra_args)?;
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.seeds.len() * self.environments.len() * self.demos.len()
    }

    pub fn loss_mode_for(&self, environment: &str) -> LossMode {
        if self.value_loss_envs.iter().any(|e| e == environment) {
            LossMode::Value
        } else {
            LossMode::V0
        }
    }

    pub fn init_temperature_for(&self, environment: &str) -> f64 {
        if self.high_temp_envs.iter().any(|e| e == environment) {
            1.0
        } else {
            0.01
        }
    }
}

fn reject_line_breaks<'a>(
    field: &'static str,
    values: impl IntoIterator<Item = &'a String>,
) -> Result<(), SweepError> {
    match values.into_iter().find(|v| v.contains(['\n', '\r'])) {
        Some(value) => Err(SweepError::LineBreak {
            field,
            value: value.clone(),
        }),
        None => Ok(()),
    }
}

/// Everything a sweep file may set. Keys missing from the file keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SweepFile {
    #[serde(flatten)]
    pub sweep: SweepConfig,
    /// Shell lines run before `srun` in every generated script.
    pub setup: Vec<String>,
    /// Nodes passed to `#SBATCH --exclude`.
    pub exclude: Vec<String>,
}

impl SweepFile {
    pub fn validate(&self) -> Result<(), SweepError> {
        self.sweep.validate()?;
        reject_line_breaks("setup", &self.setup)?;
        reject_line_breaks("exclude", &self.exclude)
    }
}

pub fn load_sweep_file(path: &Path) -> Result<SweepFile, SweepError> {
    let raw = fs::read_to_string(path).map_err(|source| SweepError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let parsed = if is_yaml {
        serde_yaml::from_str::<SweepFile>(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<SweepFile>(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| SweepError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// One fully-rendered job of the sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub seed: i64,
    pub environment: String,
    pub demo_count: u32,
    pub loss_mode: LossMode,
    pub init_temperature: f64,
    pub job_name: String,
    pub command: String,
}

impl SweepPoint {
    pub fn new(
        config: &SweepConfig,
        naming: JobNaming,
        seed: i64,
        environment: &str,
        demo_count: u32,
    ) -> Self {
        let loss_mode = config.loss_mode_for(environment);
        let init_temperature = config.init_temperature_for(environment);
        let job_name = format!(
            "{}_{}_{}_demos_{}_id_{}",
            config.job_prefix,
            environment,
            seed,
            demo_count,
            naming.next_id()
        );
        let mut parts = vec![
            config.program.trim().to_string(),
            format!("env={}", environment),
            format!("seed={}", seed),
            "agent=sac".to_string(),
            format!("expert.demos={}", demo_count),
            format!("method.loss={}", loss_mode),
            "method.regularize=True".to_string(),
            "agent.actor_lr=3e-05".to_string(),
            format!("agent.init_temp={}", init_temperature),
        ];
        parts.extend(config.extra_args.iter().cloned());
        Self {
            seed,
            environment: environment.to_string(),
            demo_count,
            loss_mode,
            init_temperature,
            job_name,
            command: parts.join(" "),
        }
    }
}

/// Cartesian product of the sweep axes, seed-major.
pub fn enumerate_sweep(config: &SweepConfig, naming: JobNaming) -> Vec<SweepPoint> {
    let mut points = Vec::with_capacity(config.point_count());
    for &seed in &config.seeds {
        for env in &config.environments {
            for &demos in &config.demos {
                points.push(SweepPoint::new(config, naming, seed, env, demos));
            }
        }
    }
    points
}

/// Random identifier shared by every file that belongs to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for BatchId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}
