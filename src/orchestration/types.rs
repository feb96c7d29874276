//! Result records passed between pipeline steps.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::orchestration::orphan_recovery::RecoveryReport;

/// Per-task export metrics, summed elementwise into run totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub rows: u64,
    pub bytes: u64,
    /// Time the task itself took; summed across tasks this is the serial time of a run
    pub elapsed_ms: u64,
}

impl TaskMetrics {
    pub fn new(rows: u64, bytes: u64, elapsed_ms: u64) -> Self {
        Self {
            rows,
            bytes,
            elapsed_ms,
        }
    }
}

impl Add for TaskMetrics {
    type Output = TaskMetrics;

    fn add(self, other: TaskMetrics) -> TaskMetrics {
        TaskMetrics {
            rows: self.rows + other.rows,
            bytes: self.bytes + other.bytes,
            elapsed_ms: self.elapsed_ms + other.elapsed_ms,
        }
    }
}

impl AddAssign for TaskMetrics {
    fn add_assign(&mut self, other: TaskMetrics) {
        *self = *self + other;
    }
}

impl Sum for TaskMetrics {
    fn sum<I: Iterator<Item = TaskMetrics>>(iter: I) -> TaskMetrics {
        iter.fold(TaskMetrics::default(), Add::add)
    }
}

/// One export of one mapped query into one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTask {
    pub index: usize,
    pub target: String,
    pub query: String,
    pub destination: PathBuf,
}

/// The archive written by the compress step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Files added to the archive
    pub entries: usize,
}

/// What a successful run reports to its caller
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Directory name of the run, formatted from the configured date format
    pub timestamp: String,
    pub export_dir: PathBuf,
    pub archive_path: PathBuf,
    pub remote_path: String,
    pub totals: TaskMetrics,
    pub archive_bytes: u64,
    pub orphans: RecoveryReport,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn rows(&self) -> u64 {
        self.totals.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_sum_elementwise() {
        let total: TaskMetrics = vec![
            TaskMetrics::new(10, 2048, 40),
            TaskMetrics::new(0, 12, 5),
            TaskMetrics::new(3, 100, 7),
        ]
        .into_iter()
        .sum();
        assert_eq!(total, TaskMetrics::new(13, 2160, 52));
    }

    #[test]
    fn test_empty_sum_is_zero() {
        let total: TaskMetrics = Vec::new().into_iter().sum();
        assert_eq!(total, TaskMetrics::default());
    }
}
