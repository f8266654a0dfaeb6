//! Outcome classification from the tail of a job's output log.

use crate::tail::read_tail_lines;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use sweep_core::config::MarkerVocabulary;

/// Terminal outcome of a job. Codes are stable and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    DidNotRun,
    Empty,
    Aborted,
    Wrong,
    Unphysical,
    DidNotConverge,
    DidNotFinish,
}

impl ExitStatus {
    pub const ALL: [ExitStatus; 8] = [
        Self::Success,
        Self::DidNotRun,
        Self::Empty,
        Self::Aborted,
        Self::Wrong,
        Self::Unphysical,
        Self::DidNotConverge,
        Self::DidNotFinish,
    ];

    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::DidNotRun => 1,
            Self::Empty => 2,
            Self::Aborted => 3,
            Self::Wrong => 4,
            Self::Unphysical => 5,
            Self::DidNotConverge => 6,
            Self::DidNotFinish => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DidNotRun => "did_not_run",
            Self::Empty => "empty",
            Self::Aborted => "aborted",
            Self::Wrong => "wrong",
            Self::Unphysical => "unphysical",
            Self::DidNotConverge => "did_not_converge",
            Self::DidNotFinish => "did_not_finish",
        }
    }

    /// Short label used in summaries.
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::DidNotRun => "DNR",
            Self::Empty => "Empty",
            Self::Aborted => "Abort",
            Self::Wrong => "Wrong",
            Self::Unphysical => "Unphysical",
            Self::DidNotConverge => "Converge",
            Self::DidNotFinish => "DNF",
        }
    }

    /// Markers that select this status. Empty for the statuses that are not
    /// matched by text.
    pub fn markers(self, vocabulary: &MarkerVocabulary) -> &[String] {
        match self {
            Self::Success => &vocabulary.success,
            Self::Aborted => &vocabulary.aborted,
            Self::Wrong => &vocabulary.wrong,
            Self::Unphysical => &vocabulary.unphysical,
            Self::DidNotConverge => &vocabulary.did_not_converge,
            Self::DidNotRun | Self::Empty | Self::DidNotFinish => &[],
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text-matched statuses in precedence order, after the success and empty
/// checks.
const MARKED: [ExitStatus; 4] = [
    ExitStatus::Aborted,
    ExitStatus::Wrong,
    ExitStatus::Unphysical,
    ExitStatus::DidNotConverge,
];

#[derive(Debug, Clone, PartialEq)]
pub struct LogVerdict {
    pub status: ExitStatus,
    /// Absent unless the tail carries the execution-time label.
    pub exec_time_secs: Option<f64>,
}

/// First match wins: success marker, empty tail, then the marked statuses,
/// falling through to `DidNotFinish`.
pub fn classify_tail(tail: &str, vocabulary: &MarkerVocabulary) -> ExitStatus {
    let contains_any = |status: ExitStatus| {
        status
            .markers(vocabulary)
            .iter()
            .any(|m| !m.is_empty() && tail.contains(m.as_str()))
    };
    if contains_any(ExitStatus::Success) {
        return ExitStatus::Success;
    }
    if tail.trim().is_empty() {
        return ExitStatus::Empty;
    }
    MARKED
        .into_iter()
        .find(|s| contains_any(*s))
        .unwrap_or(ExitStatus::DidNotFinish)
}

/// Number following the execution-time label, anywhere in the tail.
pub fn parse_exec_time(tail: &str, label: &str) -> Option<f64> {
    if label.is_empty() {
        return None;
    }
    let mut tokens = tail.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == label {
            return tokens.next().and_then(|t| t.parse::<f64>().ok());
        }
        if let Some(rest) = token.strip_prefix(label) {
            // Label glued to its value, e.g. "ExecTime(s)12.5" or "ExecTime(s)=12.5".
            let rest = rest.trim_start_matches(|c| c == '=' || c == ':');
            if !rest.is_empty() {
                return rest.parse::<f64>().ok();
            }
            return tokens.next().and_then(|t| t.parse::<f64>().ok());
        }
    }
    None
}

/// Classifies one terminal job folder. A missing log is `DidNotRun` without
/// any text matching; an unreadable one is treated as empty.
pub fn classify_job_dir(job_dir: &Path, log_name: &str, vocabulary: &MarkerVocabulary) -> LogVerdict {
    let log = job_dir.join(log_name);
    if !log.is_file() {
        return LogVerdict {
            status: ExitStatus::DidNotRun,
            exec_time_secs: None,
        };
    }
    let tail = match read_tail_lines(&log, vocabulary.tail_lines) {
        Ok(lines) => lines.join("\n"),
        Err(err) => {
            tracing::warn!(log = %log.display(), error = %err, "unreadable output log");
            String::new()
        }
    };
    LogVerdict {
        status: classify_tail(&tail, vocabulary),
        exec_time_secs: parse_exec_time(&tail, &vocabulary.exec_time_label),
    }
}
