//! Job storage: where a job currently lives and how it moves between states.
//!
//! `FsJobStore` encodes state purely by folder location and moves folders
//! with `rename`. `MemoryJobStore` keeps the same state machine in a map so
//! the queue logic can be exercised without touching disk.

use crate::layout::{compare_job_names, BatchLayout, JobState};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use walkdir::WalkDir;

const STATES: [JobState; 3] = [JobState::Pending, JobState::Running, JobState::Terminal];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found in any state directory")]
    NotFound(String),
    #[error("job {job} cannot move to {state}: destination {path} already exists")]
    Occupied {
        job: String,
        state: JobState,
        path: PathBuf,
    },
    #[error("job {job}: {message}")]
    Io { job: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub state: JobState,
    pub path: PathBuf,
}

pub trait JobStore: Send + Sync {
    /// Job names currently in `state`, sorted by index.
    fn list(&self, state: JobState) -> Result<Vec<String>, StoreError>;

    /// Whether the pending job carries its input descriptor.
    fn has_input(&self, job: &str) -> bool;

    fn locate(&self, job: &str) -> Result<Located, StoreError>;

    /// Moves the job into `to` and returns its new path. Moving a job into
    /// the state it already occupies is a no-op.
    fn transition(&self, job: &str, to: JobState) -> Result<PathBuf, StoreError>;
}

pub struct FsJobStore {
    layout: BatchLayout,
    input_file: String,
}

impl FsJobStore {
    pub fn new(layout: BatchLayout, input_file: impl Into<String>) -> Self {
        Self {
            layout,
            input_file: input_file.into(),
        }
    }

    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    fn io_err(job: &str, message: String) -> StoreError {
        StoreError::Io {
            job: job.to_string(),
            message,
        }
    }
}

impl JobStore for FsJobStore {
    fn list(&self, state: JobState) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.state_dir(state);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Self::io_err("*", format!("list {}: {}", dir.display(), e)))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_by(|a, b| compare_job_names(a, b));
        Ok(names)
    }

    fn has_input(&self, job: &str) -> bool {
        self.layout
            .state_dir(JobState::Pending)
            .join(job)
            .join(&self.input_file)
            .is_file()
    }

    fn locate(&self, job: &str) -> Result<Located, StoreError> {
        for state in STATES {
            let path = self.layout.state_dir(state).join(job);
            if path.is_dir() {
                // Running shares the terminal directory unless configured apart.
                let state = if state == JobState::Running && self.layout.running_is_terminal() {
                    JobState::Terminal
                } else {
                    state
                };
                return Ok(Located { state, path });
            }
        }
        Err(StoreError::NotFound(job.to_string()))
    }

    fn transition(&self, job: &str, to: JobState) -> Result<PathBuf, StoreError> {
        let current = self.locate(job)?;
        let target_dir = self.layout.state_dir(to);
        let target = target_dir.join(job);
        if current.path == target {
            return Ok(target);
        }
        if target.exists() {
            return Err(StoreError::Occupied {
                job: job.to_string(),
                state: to,
                path: target,
            });
        }
        fs::create_dir_all(target_dir)
            .map_err(|e| Self::io_err(job, format!("create {}: {}", target_dir.display(), e)))?;
        fs::rename(&current.path, &target).map_err(|e| {
            Self::io_err(
                job,
                format!("rename {} -> {}: {}", current.path.display(), target.display(), e),
            )
        })?;
        Ok(target)
    }
}

#[derive(Debug, Clone)]
struct MemoryJob {
    state: JobState,
    has_input: bool,
}

/// In-memory job store. Jobs registered with `fail_on` reject every
/// transition, which lets callers exercise failure isolation.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<String, MemoryJob>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: &str, state: JobState, has_input: bool) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job.to_string(), MemoryJob { state, has_input });
        }
    }

    pub fn fail_on(&self, job: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(job.to_string());
        }
    }

    pub fn state_of(&self, job: &str) -> Option<JobState> {
        self.jobs.lock().ok()?.get(job).map(|j| j.state)
    }

    fn virtual_path(job: &str, state: JobState) -> PathBuf {
        PathBuf::from("/memory").join(state.as_str()).join(job)
    }
}

impl JobStore for MemoryJobStore {
    fn list(&self, state: JobState) -> Result<Vec<String>, StoreError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| StoreError::Io { job: "*".to_string(), message: "store lock poisoned".to_string() })?;
        let mut names: Vec<String> = jobs
            .iter()
            .filter(|(_, j)| j.state == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_by(|a, b| compare_job_names(a, b));
        Ok(names)
    }

    fn has_input(&self, job: &str) -> bool {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(job).map(|j| j.state == JobState::Pending && j.has_input))
            .unwrap_or(false)
    }

    fn locate(&self, job: &str) -> Result<Located, StoreError> {
        let state = self
            .state_of(job)
            .ok_or_else(|| StoreError::NotFound(job.to_string()))?;
        Ok(Located {
            state,
            path: Self::virtual_path(job, state),
        })
    }

    fn transition(&self, job: &str, to: JobState) -> Result<PathBuf, StoreError> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(job))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Io {
                job: job.to_string(),
                message: format!("injected failure moving to {}", to),
            });
        }
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| StoreError::Io { job: job.to_string(), message: "store lock poisoned".to_string() })?;
        let entry = jobs
            .get_mut(job)
            .ok_or_else(|| StoreError::NotFound(job.to_string()))?;
        entry.state = to;
        Ok(Self::virtual_path(job, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::{ensure_dir, scratch_dir};

    fn fs_store(tag: &str, working: Option<&str>) -> (PathBuf, FsJobStore) {
        let root = scratch_dir(tag);
        ensure_dir(&root).expect("root");
        let mut config = SweepConfig::default();
        config.layout.working_dir = working.map(|w| w.to_string());
        let layout = BatchLayout::new(&root, &config).expect("layout");
        (root, FsJobStore::new(layout, "model.in"))
    }

    fn seed(root: &std::path::Path, job: &str, with_input: bool) {
        let dir = root.join("pending").join(job);
        ensure_dir(&dir).expect("job dir");
        if with_input {
            fs::write(dir.join("model.in"), "title test\n").expect("input");
        }
    }

    #[test]
    fn fs_store_moves_folders_between_states() {
        let (root, store) = fs_store("store_moves", Some("running"));
        seed(&root, "3", true);
        seed(&root, "12", false);
        fs::write(root.join("pending").join("stray.txt"), "x").expect("stray");

        assert_eq!(store.list(JobState::Pending).unwrap(), vec!["3", "12"]);
        assert!(store.has_input("3"));
        assert!(!store.has_input("12"));

        let running = store.transition("3", JobState::Running).expect("to running");
        assert!(running.join("model.in").is_file());
        assert_eq!(store.locate("3").unwrap().state, JobState::Running);

        let terminal = store.transition("3", JobState::Terminal).expect("to terminal");
        assert!(terminal.join("model.in").is_file());
        assert!(!root.join("pending").join("3").exists());
        assert!(!root.join("running").join("3").exists());
        assert_eq!(store.list(JobState::Terminal).unwrap(), vec!["3"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fs_store_refuses_to_overwrite_occupied_destination() {
        let (root, store) = fs_store("store_occupied", None);
        seed(&root, "1", true);
        ensure_dir(&root.join("terminal").join("1")).expect("occupant");
        // Pending is checked first, so the pending copy is the one located.
        let err = store.transition("1", JobState::Terminal).expect_err("occupied");
        assert!(matches!(err, StoreError::Occupied { .. }), "{}", err);
        assert!(root.join("pending").join("1").join("model.in").is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fs_store_running_collapses_into_terminal() {
        let (root, store) = fs_store("store_collapse", None);
        seed(&root, "0", true);
        let running = store.transition("0", JobState::Running).expect("running");
        let terminal = store.transition("0", JobState::Terminal).expect("terminal");
        assert_eq!(running, terminal);
        assert_eq!(store.locate("0").unwrap().state, JobState::Terminal);
        assert!(matches!(store.locate("9"), Err(StoreError::NotFound(_))));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn memory_store_tracks_state_and_injected_failures() {
        let store = MemoryJobStore::new();
        store.insert("2", JobState::Pending, true);
        store.insert("1", JobState::Pending, false);
        store.fail_on("2");
        assert_eq!(store.list(JobState::Pending).unwrap(), vec!["1", "2"]);
        assert!(store.has_input("2"));
        assert!(store.transition("2", JobState::Running).is_err());
        store.transition("1", JobState::Terminal).expect("move");
        assert_eq!(store.state_of("1"), Some(JobState::Terminal));
        assert!(!store.has_input("1"));
    }
}
