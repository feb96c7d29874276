//! # Bounded Parallel Runner
//!
//! Runs a list of independent tasks with at most `limit` of them in flight. Preprocessing uses
//! the same runner with a limit of one so its statements run strictly in order.
//!
//! On the first failure no further task is started. Tasks already running are awaited to
//! completion before the runner returns: a half-written export cannot be interrupted safely, and
//! awaiting it guarantees nothing writes into the export directory once cleanup begins.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ExporterError, Result};
use crate::orchestration::task_graph::panic_message;
use crate::orchestration::types::TaskMetrics;

/// Aggregate outcome of a successful runner invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerReport {
    /// Elementwise sum of every task's metrics
    pub metrics: TaskMetrics,
    pub completed: usize,
    pub peak_in_flight: usize,
    pub wall_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BoundedParallelRunner {
    label: String,
    limit: usize,
}

impl BoundedParallelRunner {
    pub fn new(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit: limit.max(1),
        }
    }

    /// A runner that executes one task at a time, in list order.
    pub fn serial(label: impl Into<String>) -> Self {
        Self::new(label, 1)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `task` over every item, at most `limit` at once.
    ///
    /// Returns the first error if any task failed, after every started task has settled.
    pub async fn run<I, F, Fut>(&self, items: Vec<I>, task: F) -> Result<RunnerReport>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<TaskMetrics>> + Send + 'static,
    {
        let start = Instant::now();
        let total = items.len();
        let mut queue = items.into_iter().enumerate();
        let mut join_set: JoinSet<(usize, Result<TaskMetrics>)> = JoinSet::new();
        let mut metrics = TaskMetrics::default();
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<ExporterError> = None;
        let mut peak_in_flight = 0usize;

        debug!(runner = %self.label, tasks = total, limit = self.limit, "Runner started");

        loop {
            while first_error.is_none() && join_set.len() < self.limit {
                let Some((index, item)) = queue.next() else {
                    break;
                };
                let fut = task(item);
                join_set.spawn(async move {
                    let outcome = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(ExporterError::TaskPanicked(format!(
                                "task {index} panicked: {}",
                                panic_message(&*panic)
                            )))
                        });
                    (index, outcome)
                });
                peak_in_flight = peak_in_flight.max(join_set.len());
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    // panics are caught in the task, so this is a cancelled runtime
                    error!(runner = %self.label, error = %join_err, "Runner task did not complete");
                    failed += 1;
                    first_error.get_or_insert(ExporterError::TaskPanicked(join_err.to_string()));
                    continue;
                }
            };

            match outcome {
                Ok(task_metrics) => {
                    completed += 1;
                    metrics += task_metrics;
                    debug!(
                        runner = %self.label,
                        task = index,
                        rows = task_metrics.rows,
                        bytes = task_metrics.bytes,
                        elapsed_ms = task_metrics.elapsed_ms,
                        "Runner task completed"
                    );
                }
                Err(err) => {
                    failed += 1;
                    if first_error.is_none() {
                        error!(
                            runner = %self.label,
                            task = index,
                            error = %err,
                            in_flight = join_set.len(),
                            "Runner task failed, no further tasks will start"
                        );
                        first_error = Some(err);
                    } else {
                        warn!(runner = %self.label, task = index, error = %err, "Runner task failed");
                    }
                }
            }
        }

        let wall_ms = start.elapsed().as_millis() as u64;
        match first_error {
            Some(err) => {
                error!(
                    runner = %self.label,
                    completed = completed,
                    failed = failed,
                    not_started = total - completed - failed,
                    wall_ms = wall_ms,
                    "Runner failed"
                );
                Err(err)
            }
            None => {
                info!(
                    runner = %self.label,
                    completed = completed,
                    rows = metrics.rows,
                    bytes = metrics.bytes,
                    serial_ms = metrics.elapsed_ms,
                    peak_in_flight = peak_in_flight,
                    wall_ms = wall_ms,
                    "Runner finished"
                );
                Ok(RunnerReport {
                    metrics,
                    completed,
                    peak_in_flight,
                    wall_ms,
                })
            }
        }
    }
}
