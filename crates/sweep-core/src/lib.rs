use anyhow::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub mod config;
pub mod identity;
pub mod layout;
pub mod lock;
pub mod matrix;
pub mod store;

pub use config::SweepConfig;
pub use identity::{format_scalar, format_scalar_f32, hash_vector, hash_vector_f32, HashAlgorithm, HashId};
pub use layout::{BatchLayout, JobIndex, JobState};
pub use lock::{acquire_batch_lock, BatchLock};
pub use matrix::ParameterMatrix;
pub use store::{FsJobStore, JobStore, MemoryJobStore, StoreError};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Serializes one record per line and replaces `path` atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    atomic_write_bytes(path, &buf)
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = fs::File::open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Unique scratch directory used by tests across the workspace.
pub fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "sweep_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        index: usize,
        label: String,
    }

    #[test]
    fn jsonl_survives_write_and_read() {
        let root = scratch_dir("jsonl");
        ensure_dir(&root).expect("root");
        let path = root.join("nested").join("rows.jsonl");
        let rows = vec![
            Row { index: 0, label: "a".to_string() },
            Row { index: 3, label: "b".to_string() },
        ];
        write_jsonl(&path, &rows).expect("write");
        let back: Vec<Row> = read_jsonl(&path).expect("read");
        assert_eq!(back, rows);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(root);
    }
}
