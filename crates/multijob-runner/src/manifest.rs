use anyhow::{anyhow, Context, Result};
use multijob_core::{ensure_dir, BatchId, SweepPoint};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_THRESHOLD: usize = 999;
pub const DEFAULT_SCRIPT_PREFIX: &str = "iq";

/// Where a run puts its manifests, scripts and per-job logs.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub output_dir: PathBuf,
    pub error_dir: PathBuf,
    pub script_prefix: String,
}

impl RunLayout {
    pub fn new(base_dir: &Path, output_dirname: &str, error_dirname: &str) -> Self {
        Self {
            output_dir: base_dir.join(output_dirname),
            error_dir: base_dir.join(error_dirname),
            script_prefix: DEFAULT_SCRIPT_PREFIX.to_string(),
        }
    }

    pub fn manifest_paths(&self, id: BatchId) -> ManifestPaths {
        ManifestPaths {
            now: self.output_dir.join(format!("now_{}.txt", id)),
            was: self.output_dir.join(format!("was_{}.txt", id)),
            log: self.output_dir.join(format!("log_{}.txt", id)),
            err: self.output_dir.join(format!("err_{}.txt", id)),
        }
    }

    pub fn script_path(&self, id: BatchId) -> PathBuf {
        self.output_dir.join(format!("{}_{}.slurm", self.script_prefix, id))
    }

    pub fn job_log_path(&self, point: &SweepPoint) -> PathBuf {
        self.output_dir.join(format!("{}.log", point.job_name))
    }

    pub fn job_err_path(&self, point: &SweepPoint) -> PathBuf {
        self.error_dir.join(format!("{}.error", point.job_name))
    }
}

pub fn prepare_dirs(layout: &RunLayout) -> Result<()> {
    ensure_dir(&layout.output_dir)
        .with_context(|| format!("create output dir {}", layout.output_dir.display()))?;
    info!(dir = %layout.output_dir.display(), "output directory");
    ensure_dir(&layout.error_dir)
        .with_context(|| format!("create error dir {}", layout.error_dir.display()))?;
    info!(dir = %layout.error_dir.display(), "error directory");
    Ok(())
}

/// The four line-aligned files of one batch. Line N of each describes array task N.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPaths {
    pub now: PathBuf,
    pub was: PathBuf,
    pub log: PathBuf,
    pub err: PathBuf,
}

impl ManifestPaths {
    pub fn all(&self) -> [&Path; 4] {
        [
            self.now.as_path(),
            self.was.as_path(),
            self.log.as_path(),
            self.err.as_path(),
        ]
    }
}

/// A finished batch. Its manifests are complete when this value exists.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub points: Vec<SweepPoint>,
    pub manifests: ManifestPaths,
    pub script_path: PathBuf,
}

struct ManifestFiles {
    now: File,
    was: File,
    log: File,
    err: File,
}

pub struct BatchWriter<'a> {
    layout: &'a RunLayout,
    id: BatchId,
    paths: ManifestPaths,
    files: ManifestFiles,
    points: Vec<SweepPoint>,
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open manifest {}", path.display()))
}

impl<'a> BatchWriter<'a> {
    pub fn create(layout: &'a RunLayout, id: BatchId) -> Result<Self> {
        let paths = layout.manifest_paths(id);
        if !paths.now.exists() {
            info!(path = %paths.now.display(), "creating new manifest");
        }
        let files = ManifestFiles {
            now: open_append(&paths.now)?,
            was: open_append(&paths.was)?,
            log: open_append(&paths.log)?,
            err: open_append(&paths.err)?,
        };
        Ok(Self {
            layout,
            id,
            paths,
            files,
            points: Vec::new(),
        })
    }

    pub fn append(&mut self, point: SweepPoint) -> Result<()> {
        let log_path = self.layout.job_log_path(&point);
        let err_path = self.layout.job_err_path(&point);
        writeln!(self.files.now, "{}", point.command)?;
        writeln!(self.files.was, "{}", point.command)?;
        writeln!(self.files.log, "{}", log_path.display())?;
        writeln!(self.files.err, "{}", err_path.display())?;
        debug!(batch = %self.id, job = %point.job_name, "queued job");
        self.points.push(point);
        Ok(())
    }

    pub fn finish(mut self) -> Result<Batch> {
        for file in [
            &mut self.files.now,
            &mut self.files.was,
            &mut self.files.log,
            &mut self.files.err,
        ] {
            file.flush()?;
        }
        Ok(Batch {
            id: self.id,
            script_path: self.layout.script_path(self.id),
            points: self.points,
            manifests: self.paths,
        })
    }
}

fn write_batch(layout: &RunLayout, id: BatchId, points: &[SweepPoint]) -> Result<Batch> {
    let mut writer = BatchWriter::create(layout, id)?;
    for point in points {
        writer.append(point.clone())?;
    }
    writer.finish()
}

/// Splits `points` into batches of at most `threshold` jobs and writes their manifests.
pub fn write_batches(
    layout: &RunLayout,
    points: &[SweepPoint],
    threshold: usize,
    mut next_id: impl FnMut() -> BatchId,
) -> Result<Vec<Batch>> {
    check_threshold(threshold)?;
    points
        .chunks(threshold)
        .map(|chunk| write_batch(layout, next_id(), chunk))
        .collect()
}

pub(crate) fn check_threshold(threshold: usize) -> Result<()> {
    if threshold == 0 {
        return Err(anyhow!("batch threshold must be at least 1"));
    }
    Ok(())
}

pub fn count_lines(path: &Path) -> Result<usize> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    Ok(data.lines().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use multijob_core::{enumerate_sweep, JobNaming, SweepConfig};

    fn temp_layout(tag: &str) -> (PathBuf, RunLayout) {
        let root = std::env::temp_dir().join(format!(
            "multijob_manifest_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = RunLayout::new(&root, "out", "err");
        prepare_dirs(&layout).expect("dirs");
        (root, layout)
    }

    fn points(n_seeds: usize) -> Vec<SweepPoint> {
        let config = SweepConfig {
            seeds: (1..=n_seeds as i64).collect(),
            environments: vec!["cup_catch".to_string()],
            demos: vec![10],
            ..SweepConfig::default()
        };
        enumerate_sweep(&config, JobNaming::Placeholder)
    }

    #[test]
    fn batch_sizes_follow_threshold() {
        let (root, layout) = temp_layout("sizes");
        let cases = [(7usize, 3usize, vec![3, 3, 1]), (6, 3, vec![3, 3]), (1, 999, vec![1])];
        for (total, threshold, expected) in cases {
            let batches =
                write_batches(&layout, &points(total), threshold, BatchId::new).expect("write");
            let sizes: Vec<usize> = batches.iter().map(|b| b.points.len()).collect();
            assert_eq!(sizes, expected, "total={} threshold={}", total, threshold);
            assert_eq!(batches.len(), total.div_ceil(threshold));
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_sweep_writes_no_batches() {
        let (root, layout) = temp_layout("empty");
        let batches = write_batches(&layout, &[], 999, BatchId::new).expect("write");
        assert!(batches.is_empty());
        let entries = fs::read_dir(&layout.output_dir).expect("read dir").count();
        assert_eq!(entries, 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let (root, layout) = temp_layout("zero");
        let err = write_batches(&layout, &points(2), 0, BatchId::new).expect_err("zero");
        assert!(err.to_string().contains("threshold"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn manifests_stay_line_aligned() {
        let (root, layout) = temp_layout("aligned");
        let batches = write_batches(&layout, &points(5), 2, BatchId::new).expect("write");
        for batch in &batches {
            for path in batch.manifests.all() {
                assert_eq!(
                    count_lines(path).expect("count"),
                    batch.points.len(),
                    "{}",
                    path.display()
                );
            }
        }
        let first = &batches[0];
        let now = fs::read_to_string(&first.manifests.now).expect("now");
        let was = fs::read_to_string(&first.manifests.was).expect("was");
        assert_eq!(now, was);
        let log = fs::read_to_string(&first.manifests.log).expect("log");
        let err = fs::read_to_string(&first.manifests.err).expect("err");
        let log_first = log.lines().next().expect("line");
        let err_first = err.lines().next().expect("line");
        assert_eq!(
            PathBuf::from(log_first),
            layout.output_dir.join("iq_learn_cup_catch_1_demos_10_id_NONE.log")
        );
        assert_eq!(
            PathBuf::from(err_first),
            layout.error_dir.join("iq_learn_cup_catch_1_demos_10_id_NONE.error")
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn every_batch_gets_its_own_files() {
        let (root, layout) = temp_layout("ids");
        let batches = write_batches(&layout, &points(4), 2, BatchId::new).expect("write");
        assert_eq!(batches.len(), 2);
        assert_ne!(batches[0].id, batches[1].id);
        assert_ne!(batches[0].manifests, batches[1].manifests);
        assert_ne!(batches[0].script_path, batches[1].script_path);
        let id = batches[0].id.to_string();
        for path in batches[0].manifests.all() {
            assert!(path.to_string_lossy().contains(&id));
        }
        assert!(batches[0].script_path.to_string_lossy().ends_with(&format!("iq_{}.slurm", id)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prepare_dirs_is_idempotent() {
        let (root, layout) = temp_layout("dirs");
        prepare_dirs(&layout).expect("second call");
        assert!(layout.output_dir.is_dir());
        assert!(layout.error_dir.is_dir());
        let _ = fs::remove_dir_all(root);
    }
}
