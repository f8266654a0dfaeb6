use crate::ensure_dir;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use tracing::warn;

pub const LOCK_FILE_NAME: &str = ".sweep.lock";

/// Exclusive hold on a batch root. Queue runs and reconciliation both take
/// it, so the two phases never overlap on one root.
#[derive(Debug)]
pub struct BatchLock {
    path: PathBuf,
}

impl BatchLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Takes the root's lock. A lock left behind by a process that no longer
/// exists is replaced once.
pub fn acquire_batch_lock(root: &Path, operation: &str) -> Result<BatchLock> {
    ensure_dir(root)?;
    let lock_path = root.join(LOCK_FILE_NAME);
    match try_create(&lock_path, operation)? {
        Some(lock) => Ok(lock),
        None => {
            let holder = fs::read_to_string(&lock_path).unwrap_or_default();
            if let Some(pid) = holder_pid(&holder) {
                if !process_alive(pid) {
                    warn!(pid, path = %lock_path.display(), "removing stale batch lock");
                    let _ = fs::remove_file(&lock_path);
                    if let Some(lock) = try_create(&lock_path, operation)? {
                        return Ok(lock);
                    }
                }
            }
            Err(anyhow!(
                "operation_in_progress: batch {} is locked by {}",
                root.display(),
                holder.trim()
            ))
        }
    }
}

fn try_create(lock_path: &Path, operation: &str) -> Result<Option<BatchLock>> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            let payload = json!({
                "pid": std::process::id(),
                "operation": operation,
                "acquired_at": Utc::now().to_rfc3339(),
            });
            let _ = writeln!(file, "{}", payload);
            let _ = file.sync_all();
            Ok(Some(BatchLock {
                path: lock_path.to_path_buf(),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pid recorded in a lock payload. Unreadable payloads yield `None` and are
/// treated as held.
fn holder_pid(payload: &str) -> Option<u32> {
    let value: Value = serde_json::from_str(payload.trim()).ok()?;
    value.get("pid")?.as_u64().and_then(|p| u32::try_from(p).ok())
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).is_some()
}
