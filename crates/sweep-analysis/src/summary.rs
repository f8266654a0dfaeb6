use crate::classify::ExitStatus;
use crate::reconcile::{ClassificationRecord, TimingRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: ExitStatus,
    pub code: u8,
    pub label: String,
    pub count: usize,
    /// Share of processed jobs, 0..=100.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub mean_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    /// Rows in the parameter matrix, when one was found.
    pub total: Option<usize>,
    pub statuses: Vec<StatusCount>,
    pub success_duration: Option<DurationStats>,
}

impl BatchSummary {
    pub fn count(&self, status: ExitStatus) -> usize {
        self.statuses
            .iter()
            .find(|s| s.status == status)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

/// Counts every status (zeros included, in code order) and the duration of
/// successful jobs that reported one.
pub fn summarize(
    classification: &[ClassificationRecord],
    timing: &[TimingRecord],
    total: Option<usize>,
) -> BatchSummary {
    let processed = classification.len();
    let statuses = ExitStatus::ALL
        .iter()
        .map(|&status| {
            let count = classification.iter().filter(|r| r.status == status).count();
            let percent = if processed == 0 {
                0.0
            } else {
                100.0 * count as f64 / processed as f64
            };
            StatusCount {
                status,
                code: status.code(),
                label: status.label().to_string(),
                count,
                percent,
            }
        })
        .collect();

    let durations: Vec<f64> = classification
        .iter()
        .filter(|r| r.status == ExitStatus::Success)
        .filter_map(|r| {
            timing
                .iter()
                .find(|t| t.index == r.index)
                .and_then(|t| t.exec_time_secs)
        })
        .collect();
    let success_duration = (!durations.is_empty()).then(|| DurationStats {
        count: durations.len(),
        mean_secs: durations.iter().sum::<f64>() / durations.len() as f64,
        min_secs: durations.iter().copied().fold(f64::INFINITY, f64::min),
        max_secs: durations.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    });

    BatchSummary {
        processed,
        total,
        statuses,
        success_duration,
    }
}
