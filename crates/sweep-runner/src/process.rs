use crate::{job_timeout, ExecOutcome, Executor};
use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use sweep_core::SweepConfig;
use tracing::debug;
use wait_timeout::ChildExt;

/// Runs the simulation binary directly (no shell) with the job's input
/// descriptor as its only argument and the job folder as working directory.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    executable: PathBuf,
    input_file: String,
    output_log: String,
    capture_stdout: bool,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(executable: &Path, input_file: &str, output_log: &str, timeout: Duration) -> Self {
        Self {
            executable: resolve_executable(executable),
            input_file: input_file.to_string(),
            output_log: output_log.to_string(),
            capture_stdout: false,
            timeout,
        }
    }

    pub fn from_config(config: &SweepConfig) -> Result<Self> {
        if config.execution.timeout_secs == 0 {
            return Err(anyhow!("execution.timeout_secs must be at least 1"));
        }
        Ok(Self::new(
            &config.execution.executable,
            &config.files.input,
            &config.files.output_log,
            job_timeout(config),
        )
        .with_capture_stdout(config.execution.capture_stdout))
    }

    pub fn with_capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, job: &str, job_dir: &Path) -> Result<ExecOutcome> {
        let stdout = if self.capture_stdout {
            Stdio::from(fs::File::create(job_dir.join(&self.output_log))?)
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&self.executable)
            .arg(&self.input_file)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {}: {}", self.executable.display(), e))?;
        debug!(job = %job, pid = child.id(), "spawned simulation");

        let waited = child.wait_timeout(self.timeout);
        settle_child(&mut child, waited)
            .map_err(|e| anyhow!("failed to wait on {}: {}", self.executable.display(), e))
    }
}

/// Turns a wait result into an outcome. On timeout or on a failed wait the
/// child is killed and reaped before returning.
fn settle_child(child: &mut Child, waited: io::Result<Option<ExitStatus>>) -> io::Result<ExecOutcome> {
    match waited {
        Ok(Some(status)) => Ok(ExecOutcome::Exited {
            code: status.code(),
        }),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Ok(ExecOutcome::TimedOut)
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(err)
        }
    }
}

/// Expands a leading `~/` and anchors relative paths that contain a
/// directory to the current directory, since the child runs elsewhere.
/// Bare names are left for `PATH` lookup.
fn resolve_executable(executable: &Path) -> PathBuf {
    let raw = executable.to_string_lossy();
    let expanded = match (raw.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => executable.to_path_buf(),
    };
    if expanded.is_absolute() || expanded.components().count() <= 1 {
        return expanded;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&expanded))
        .unwrap_or(expanded)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use sweep_core::{ensure_dir, scratch_dir};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("script");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[test]
    fn process_runs_in_job_dir_with_input_argument() {
        let root = scratch_dir("proc_ok");
        let job_dir = root.join("job");
        ensure_dir(&job_dir).expect("job dir");
        fs::write(job_dir.join("model.in"), "title\n").expect("input");
        let script = write_script(
            &root,
            "sim.sh",
            "echo \"arg=$1\" > model.out\necho ' Cloudy exited OK ExecTime(s) 1.5' >> model.out\nexit 3",
        );
        let exec = ProcessExecutor::new(&script, "model.in", "model.out", Duration::from_secs(10));
        let outcome = exec.execute("0", &job_dir).expect("execute");
        assert_eq!(outcome, ExecOutcome::Exited { code: Some(3) });
        let log = fs::read_to_string(job_dir.join("model.out")).expect("log");
        assert!(log.starts_with("arg=model.in"), "{}", log);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn process_is_killed_on_timeout() {
        let root = scratch_dir("proc_timeout");
        let job_dir = root.join("job");
        ensure_dir(&job_dir).expect("job dir");
        let script = write_script(&root, "slow.sh", "exec sleep 30");
        let exec = ProcessExecutor::new(&script, "model.in", "model.out", Duration::from_millis(200));
        let started = std::time::Instant::now();
        let outcome = exec.execute("0", &job_dir).expect("execute");
        assert_eq!(outcome, ExecOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_wait_kills_and_reaps_the_child() {
        let root = scratch_dir("proc_wait_err");
        ensure_dir(&root).expect("root");
        let script = write_script(&root, "slow.sh", "exec sleep 30");
        let mut child = Command::new(&script).spawn().expect("spawn");
        let started = std::time::Instant::now();
        let waited = Err(io::Error::new(io::ErrorKind::Interrupted, "wait interrupted"));
        let err = settle_child(&mut child, waited).expect_err("wait error surfaces");
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(matches!(child.try_wait(), Ok(Some(_))), "child still running");
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stdout_can_be_captured_into_the_log() {
        let root = scratch_dir("proc_capture");
        let job_dir = root.join("job");
        ensure_dir(&job_dir).expect("job dir");
        let script = write_script(&root, "talk.sh", "echo ' Cloudy exited OK'");
        let exec = ProcessExecutor::new(&script, "model.in", "model.out", Duration::from_secs(10))
            .with_capture_stdout(true);
        exec.execute("0", &job_dir).expect("execute");
        let log = fs::read_to_string(job_dir.join("model.out")).expect("log");
        assert_eq!(log.trim(), "Cloudy exited OK");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_executable_is_an_error() {
        let root = scratch_dir("proc_missing");
        ensure_dir(&root).expect("root");
        let exec = ProcessExecutor::new(
            &root.join("does-not-exist"),
            "model.in",
            "model.out",
            Duration::from_secs(1),
        );
        assert!(exec.execute("0", &root).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn home_relative_executable_is_expanded() {
        if let Some(home) = std::env::var_os("HOME") {
            let resolved = resolve_executable(Path::new("~/c17.03/source/cloudy.exe"));
            assert_eq!(resolved, PathBuf::from(home).join("c17.03/source/cloudy.exe"));
        }
        assert_eq!(resolve_executable(Path::new("cloudy.exe")), PathBuf::from("cloudy.exe"));
    }
}
