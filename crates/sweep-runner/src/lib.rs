//! Job queue manager.
//!
//! Discovers pending job folders, then drives them through
//! `Pending -> Running -> Terminal` on a fixed-size worker pool, running the
//! simulation once per job. Outcomes are not judged here: a job that
//! crashed, timed out or never started still ends up in the terminal
//! directory and is classified later from its artifacts.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use sweep_core::{
    acquire_batch_lock, atomic_write_json_pretty, BatchLayout, FsJobStore, JobState, JobStore,
    SweepConfig,
};
use tracing::{debug, info, warn};

mod process;

pub use process::ProcessExecutor;

/// How the simulation process for one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Exit code is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
    TimedOut,
}

pub trait Executor: Send + Sync {
    fn execute(&self, job: &str, job_dir: &Path) -> Result<ExecOutcome>;
}

impl<F> Executor for F
where
    F: Fn(&str, &Path) -> Result<ExecOutcome> + Send + Sync,
{
    fn execute(&self, job: &str, job_dir: &Path) -> Result<ExecOutcome> {
        self(job, job_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobRunStatus {
    Completed { exit_code: Option<i32> },
    TimedOut,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    #[serde(flatten)]
    pub status: JobRunStatus,
    /// State the job folder was left in.
    pub final_state: Option<JobState>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: usize,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn count(&self, pred: impl Fn(&JobRunStatus) -> bool) -> usize {
        self.jobs.iter().filter(|j| pred(&j.status)).count()
    }

    pub fn terminal_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.final_state == Some(JobState::Terminal))
            .count()
    }
}

/// Pending jobs that carry an input descriptor, in index order, truncated to
/// `batch_limit` when given. Jobs beyond the limit are left untouched.
pub fn discover(store: &dyn JobStore, batch_limit: Option<usize>) -> Result<Vec<String>> {
    let mut jobs: Vec<String> = store
        .list(JobState::Pending)?
        .into_iter()
        .filter(|job| {
            let ok = store.has_input(job);
            if !ok {
                debug!(job = %job, "skipping pending folder without input descriptor");
            }
            ok
        })
        .collect();
    if let Some(limit) = batch_limit {
        jobs.truncate(limit);
    }
    Ok(jobs)
}

pub struct QueueManager<'a> {
    store: &'a dyn JobStore,
    executor: &'a dyn Executor,
    workers: usize,
}

impl<'a> QueueManager<'a> {
    pub fn new(store: &'a dyn JobStore, executor: &'a dyn Executor, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(anyhow!("worker count must be at least 1"));
        }
        Ok(Self {
            store,
            executor,
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every job on the pool. Each worker takes one job at a time and
    /// carries nothing over between jobs; a failing job never stops the
    /// others.
    pub fn run(&self, jobs: Vec<String>) -> RunReport {
        let started_at = Utc::now();
        let total = jobs.len();
        let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
        let reports = Mutex::new(Vec::with_capacity(total));
        let pool_size = self.workers.min(total.max(1));
        info!(jobs = total, workers = pool_size, "starting queue run");

        thread::scope(|scope| {
            for worker in 0..pool_size {
                let queue = &queue;
                let reports = &reports;
                scope.spawn(move || loop {
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some(job) = next else { break };
                    let report = self.run_job(worker, &job);
                    if let Ok(mut r) = reports.lock() {
                        r.push(report);
                    }
                });
            }
        });

        let mut jobs = reports.into_inner().unwrap_or_default();
        jobs.sort_by(|a, b| sweep_core::layout::compare_job_names(&a.job, &b.job));
        let finished_at = Utc::now();
        info!(
            jobs = jobs.len(),
            failed = jobs.iter().filter(|j| matches!(j.status, JobRunStatus::Failed { .. })).count(),
            timed_out = jobs.iter().filter(|j| j.status == JobRunStatus::TimedOut).count(),
            "queue run finished"
        );
        RunReport {
            run_id: format!("queue_run_{}", started_at.format("%Y%m%d_%H%M%S_%6f")),
            started_at,
            finished_at,
            workers: pool_size,
            jobs,
        }
    }

    fn run_job(&self, worker: usize, job: &str) -> JobReport {
        let start = Instant::now();
        let status = match panic::catch_unwind(AssertUnwindSafe(|| self.process_job(job))) {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                warn!(worker, job = %job, error = %err, "job failed");
                JobRunStatus::Failed {
                    error: err.to_string(),
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                warn!(worker, job = %job, error = %message, "job panicked");
                JobRunStatus::Failed { error: message }
            }
        };
        let final_state = self.settle(job);
        JobReport {
            job: job.to_string(),
            status,
            final_state,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }

    /// A job left in `Running` (the executor panicked, or the move after it
    /// failed) is pushed on to `Terminal` so no folder stays in the working
    /// directory.
    fn settle(&self, job: &str) -> Option<JobState> {
        let located = self.store.locate(job).ok()?;
        if located.state != JobState::Running {
            return Some(located.state);
        }
        match self.store.transition(job, JobState::Terminal) {
            Ok(_) => Some(JobState::Terminal),
            Err(err) => {
                warn!(job = %job, error = %err, "job left in working directory");
                Some(JobState::Running)
            }
        }
    }

    fn process_job(&self, job: &str) -> Result<JobRunStatus> {
        let job_dir = self.store.transition(job, JobState::Running)?;
        info!(job = %job, dir = %job_dir.display(), "running job");

        let exec = self.executor.execute(job, &job_dir);
        let moved = self.store.transition(job, JobState::Terminal);

        let status = match exec {
            Ok(ExecOutcome::Exited { code }) => JobRunStatus::Completed { exit_code: code },
            Ok(ExecOutcome::TimedOut) => {
                warn!(job = %job, "job timed out, process terminated");
                JobRunStatus::TimedOut
            }
            Err(err) => {
                // The folder still moves on so classification sees it.
                moved?;
                return Err(err.context(format!("job {} did not run", job)));
            }
        };
        moved?;
        debug!(job = %job, "job moved to terminal");
        Ok(status)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workers: Option<usize>,
    pub batch_limit: Option<usize>,
}

#[derive(Debug)]
pub struct BatchRunResult {
    pub report: RunReport,
    pub report_path: PathBuf,
}

/// Discover + run over a batch root with the filesystem store and the
/// process executor, writing the run report under `runtime/`.
pub fn run_batch(root: &Path, config: &SweepConfig, options: &RunOptions) -> Result<BatchRunResult> {
    let layout = BatchLayout::new(root, config)?;
    let _lock = acquire_batch_lock(&layout.root, "run")?;
    if !layout.pending.is_dir() {
        warn!(dir = %layout.pending.display(), "pending directory not found, nothing to run");
    }
    let runtime_dir = layout.runtime.clone();
    let store = FsJobStore::new(layout, config.files.input.clone());
    let executor = ProcessExecutor::from_config(config)?;
    let workers = options.workers.unwrap_or_else(num_cpus::get);

    let jobs = discover(&store, options.batch_limit)?;
    info!(found = jobs.len(), "discovered pending jobs");
    let manager = QueueManager::new(&store, &executor, workers)?;
    let report = manager.run(jobs);

    let mut report_path = runtime_dir.join(format!("{}.json", report.run_id));
    let mut suffix = 1;
    while report_path.exists() {
        report_path = runtime_dir.join(format!("{}_{}.json", report.run_id, suffix));
        suffix += 1;
    }
    let mut value = serde_json::to_value(&report)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("schema_version".to_string(), "queue_run_v1".into());
        obj.insert(
            "timeout_secs".to_string(),
            config.execution.timeout_secs.into(),
        );
    }
    atomic_write_json_pretty(&report_path, &value)?;
    Ok(BatchRunResult {
        report,
        report_path,
    })
}

/// Batch-wide per-job timeout.
pub fn job_timeout(config: &SweepConfig) -> Duration {
    Duration::from_secs(config.execution.timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sweep_core::MemoryJobStore;

    fn seeded_store(n: usize) -> MemoryJobStore {
        let store = MemoryJobStore::new();
        for i in 0..n {
            store.insert(&i.to_string(), JobState::Pending, true);
        }
        store
    }

    fn ok_executor(_: &str, _: &Path) -> Result<ExecOutcome> {
        Ok(ExecOutcome::Exited { code: Some(0) })
    }

    #[test]
    fn discover_respects_batch_limit_in_index_order() {
        let store = seeded_store(5);
        store.insert("99", JobState::Pending, false);
        let jobs = discover(&store, Some(2)).expect("discover");
        assert_eq!(jobs, vec!["0", "1"]);
        let all = discover(&store, None).expect("discover");
        assert_eq!(all, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn limited_run_leaves_the_rest_pending() {
        let store = seeded_store(5);
        let jobs = discover(&store, Some(2)).expect("discover");
        let manager = QueueManager::new(&store, &ok_executor, 4).expect("manager");
        let report = manager.run(jobs);
        assert_eq!(report.terminal_count(), 2);
        assert_eq!(store.list(JobState::Pending).unwrap().len(), 3);
        assert_eq!(store.list(JobState::Terminal).unwrap(), vec!["0", "1"]);
    }

    #[test]
    fn discovery_is_empty_after_full_run() {
        let store = seeded_store(6);
        let manager = QueueManager::new(&store, &ok_executor, 3).expect("manager");
        let report = manager.run(discover(&store, None).unwrap());
        assert_eq!(report.jobs.len(), 6);
        assert!(discover(&store, None).unwrap().is_empty());
    }

    #[test]
    fn failures_and_timeouts_are_isolated() {
        let store = seeded_store(4);
        store.fail_on("2");
        let executor = |job: &str, _: &Path| -> Result<ExecOutcome> {
            match job {
                "0" => Err(anyhow!("spawn failed")),
                "1" => Ok(ExecOutcome::TimedOut),
                "3" => panic!("boom"),
                _ => Ok(ExecOutcome::Exited { code: Some(1) }),
            }
        };
        let manager = QueueManager::new(&store, &executor, 2).expect("manager");
        let report = manager.run(discover(&store, None).unwrap());
        assert_eq!(report.jobs.len(), 4);

        let by_job = |name: &str| report.jobs.iter().find(|j| j.job == name).unwrap().clone();
        match by_job("0").status {
            JobRunStatus::Failed { error } => assert!(error.contains("did not run"), "{}", error),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(by_job("0").final_state, Some(JobState::Terminal));
        assert_eq!(by_job("1").status, JobRunStatus::TimedOut);
        assert_eq!(by_job("1").final_state, Some(JobState::Terminal));
        assert!(matches!(by_job("2").status, JobRunStatus::Failed { .. }));
        assert_eq!(by_job("2").final_state, Some(JobState::Pending));
        match by_job("3").status {
            JobRunStatus::Failed { error } => assert_eq!(error, "boom"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(by_job("3").final_state, Some(JobState::Terminal));
        assert_eq!(store.state_of("3"), Some(JobState::Terminal));
    }

    #[test]
    fn panicking_executor_still_moves_job_to_terminal() {
        let store = seeded_store(2);
        let executor = |job: &str, _: &Path| -> Result<ExecOutcome> {
            if job == "1" {
                panic!("simulation crashed");
            }
            Ok(ExecOutcome::Exited { code: Some(0) })
        };
        let manager = QueueManager::new(&store, &executor, 1).expect("manager");
        let report = manager.run(discover(&store, None).unwrap());
        assert_eq!(report.terminal_count(), 2);
        assert!(store.list(JobState::Running).unwrap().is_empty());
        assert!(discover(&store, None).unwrap().is_empty());
    }

    #[test]
    fn every_job_runs_exactly_once() {
        let store = seeded_store(20);
        let calls = AtomicUsize::new(0);
        let executor = |_: &str, _: &Path| -> Result<ExecOutcome> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutcome::Exited { code: Some(0) })
        };
        let manager = QueueManager::new(&store, &executor, 4).expect("manager");
        let report = manager.run(discover(&store, None).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(report.workers, 4);
        let names: Vec<_> = report.jobs.iter().map(|j| j.job.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let store = seeded_store(1);
        assert!(QueueManager::new(&store, &ok_executor, 0).is_err());
    }

    #[test]
    fn run_report_serializes_flat_status() {
        let report = JobReport {
            job: "7".to_string(),
            status: JobRunStatus::Completed { exit_code: Some(0) },
            final_state: Some(JobState::Terminal),
            elapsed_secs: 1.5,
        };
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["final_state"], "terminal");
    }
}

#[cfg(all(test, unix))]
mod batch_tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use sweep_core::{ensure_dir, scratch_dir};

    fn seed_batch(tag: &str, jobs: usize) -> (PathBuf, SweepConfig) {
        let root = scratch_dir(tag);
        for i in 0..jobs {
            let dir = root.join("pending").join(i.to_string());
            ensure_dir(&dir).expect("job dir");
            fs::write(dir.join("model.in"), format!("title job {}\n", i)).expect("input");
        }
        let script = root.join("sim.sh");
        fs::write(
            &script,
            "#!/bin/sh\necho ' Cloudy exited OK [Oct17 12:00:00] ExecTime(s) 0.01' > model.out\n",
        )
        .expect("script");
        let mut perms = fs::metadata(&script).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod");

        let mut config = SweepConfig::default();
        config.execution.executable = script;
        config.execution.timeout_secs = 30;
        (root, config)
    }

    #[test]
    fn batch_run_moves_every_job_to_terminal() {
        let (root, config) = seed_batch("batch_e2e", 4);
        let options = RunOptions {
            workers: Some(4),
            batch_limit: None,
        };
        let result = run_batch(&root, &config, &options).expect("run");
        assert_eq!(result.report.jobs.len(), 4);
        assert!(result.report_path.is_file());

        let pending: Vec<_> = fs::read_dir(root.join("pending")).expect("pending").collect();
        assert!(pending.is_empty());
        let mut terminal: Vec<String> = fs::read_dir(root.join("terminal"))
            .expect("terminal")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        terminal.sort();
        assert_eq!(terminal, vec!["0", "1", "2", "3"]);
        for job in &terminal {
            let dir = root.join("terminal").join(job);
            assert!(dir.join("model.in").is_file());
            assert!(dir.join("model.out").is_file());
        }
        assert!(!root.join(sweep_core::lock::LOCK_FILE_NAME).exists());

        let again = run_batch(&root, &config, &options).expect("second run");
        assert!(again.report.jobs.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn batch_run_honours_batch_limit() {
        let (root, config) = seed_batch("batch_limit", 5);
        let options = RunOptions {
            workers: Some(2),
            batch_limit: Some(2),
        };
        let result = run_batch(&root, &config, &options).expect("run");
        assert_eq!(result.report.terminal_count(), 2);
        assert_eq!(fs::read_dir(root.join("pending")).expect("pending").count(), 3);
        assert!(root.join("terminal").join("0").is_dir());
        assert!(root.join("terminal").join("1").is_dir());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn consecutive_runs_keep_separate_reports() {
        let (root, config) = seed_batch("batch_reports", 3);
        let options = RunOptions {
            workers: Some(1),
            batch_limit: Some(1),
        };
        let first = run_batch(&root, &config, &options).expect("first run");
        let second = run_batch(&root, &config, &options).expect("second run");
        assert_ne!(first.report_path, second.report_path);
        assert!(first.report_path.is_file());
        assert!(second.report_path.is_file());
        assert_eq!(fs::read_dir(root.join("runtime")).expect("runtime").count(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn batch_run_refuses_locked_root() {
        let (root, config) = seed_batch("batch_locked", 1);
        let _held = acquire_batch_lock(&root, "parse").expect("lock");
        let err = run_batch(&root, &config, &RunOptions::default()).expect_err("locked");
        assert!(err.to_string().contains("operation_in_progress"), "{}", err);
        assert!(root.join("pending").join("0").is_dir());
        let _ = fs::remove_dir_all(root);
    }
}
