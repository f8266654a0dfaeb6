//! On-disk layout of one sample batch.
//!
//! ```text
//! <root>/
//!   <pending_dir>/<index>/model.in
//!   [<working_dir>/<index>/...]
//!   <terminal_dir>/<index>/model.out, model.emis, model.cont
//!   parameters_*.npy
//!   <analysis_dir>/...
//! ```

use crate::config::SweepConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const MATRIX_PREFIX: &str = "parameters";
const MATRIX_EXTENSIONS: [&str; 4] = ["npy", "txt", "dat", "csv"];

/// Folder-encoded lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Terminal,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional index of a job: its row in the parameter matrix and the name
/// of its folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIndex(pub usize);

impl JobIndex {
    pub fn parse(folder_name: &str) -> Option<Self> {
        folder_name.trim().parse::<usize>().ok().map(JobIndex)
    }
}

impl fmt::Display for JobIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Orders job folder names by numeric index; names that are not indices sort
/// after all indices, by name.
pub fn compare_job_names(a: &str, b: &str) -> Ordering {
    match (JobIndex::parse(a), JobIndex::parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[derive(Debug, Clone)]
pub struct BatchLayout {
    pub root: PathBuf,
    pub pending: PathBuf,
    pub working: Option<PathBuf>,
    pub terminal: PathBuf,
    pub analysis: PathBuf,
    pub runtime: PathBuf,
    matrix_override: Option<PathBuf>,
}

impl BatchLayout {
    /// Fails only when `root` is not an existing directory.
    pub fn new(root: &Path, config: &SweepConfig) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("batch root is not a directory: {}", root.display()));
        }
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let layout = &config.layout;
        Ok(Self {
            pending: root.join(&layout.pending_dir),
            working: layout.working_dir.as_ref().map(|d| root.join(d)),
            terminal: root.join(&layout.terminal_dir),
            analysis: root.join(&layout.analysis_dir),
            runtime: root.join("runtime"),
            matrix_override: layout.parameter_matrix.as_ref().map(|m| root.join(m)),
            root,
        })
    }

    pub fn state_dir(&self, state: JobState) -> &Path {
        match state {
            JobState::Pending => &self.pending,
            JobState::Running => self.working.as_deref().unwrap_or(&self.terminal),
            JobState::Terminal => &self.terminal,
        }
    }

    /// Whether `Running` and `Terminal` share one directory.
    pub fn running_is_terminal(&self) -> bool {
        self.state_dir(JobState::Running) == self.state_dir(JobState::Terminal)
    }

    /// The configured matrix file, or the first root file named
    /// `parameters*.{npy,txt,dat,csv}` in name order.
    pub fn parameter_matrix(&self) -> Option<PathBuf> {
        if let Some(path) = &self.matrix_override {
            return path.is_file().then(|| path.clone());
        }
        let mut candidates: Vec<PathBuf> = fs::read_dir(&self.root)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
                name.starts_with(MATRIX_PREFIX) && MATRIX_EXTENSIONS.contains(&ext)
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure_dir, scratch_dir};

    #[test]
    fn job_names_sort_numerically() {
        let mut names = vec!["10", "2", "b", "0", "a", "1"];
        names.sort_by(|a, b| compare_job_names(a, b));
        assert_eq!(names, vec!["0", "1", "2", "10", "a", "b"]);
        assert_eq!(JobIndex::parse("0007"), Some(JobIndex(7)));
        assert_eq!(JobIndex::parse("x7"), None);
    }

    #[test]
    fn running_state_defaults_to_terminal_dir() {
        let root = scratch_dir("layout");
        ensure_dir(&root).expect("root");
        let mut config = SweepConfig::default();
        let layout = BatchLayout::new(&root, &config).expect("layout");
        assert!(layout.running_is_terminal());
        assert!(layout.state_dir(JobState::Pending).ends_with("pending"));

        config.layout.working_dir = Some("running".to_string());
        let layout = BatchLayout::new(&root, &config).expect("layout");
        assert!(!layout.running_is_terminal());
        assert!(layout.state_dir(JobState::Running).ends_with("running"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn matrix_is_autodetected_by_prefix() {
        let root = scratch_dir("layout_matrix");
        ensure_dir(&root).expect("root");
        let config = SweepConfig::default();
        let layout = BatchLayout::new(&root, &config).expect("layout");
        assert!(layout.parameter_matrix().is_none());

        fs::write(root.join("notes.txt"), "x").expect("write");
        fs::write(root.join("parameters_N10.npy"), "x").expect("write");
        let found = layout.parameter_matrix().expect("matrix");
        assert!(found.ends_with("parameters_N10.npy"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_is_fatal() {
        let root = scratch_dir("layout_missing");
        assert!(BatchLayout::new(&root, &SweepConfig::default()).is_err());
    }
}
