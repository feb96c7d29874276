//! Mutable state of one run: its phase and the resources finalization must release.
//!
//! Steps record a resource as soon as they own it. Finalization takes each one exactly once, so
//! the connection is closed once and each artifact is deleted once, whatever happened before.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::RunPhase;
use crate::database::SourceDatabase;
use crate::error::ExporterError;
use crate::orchestration::task_graph::StepObserver;

#[derive(Debug)]
struct RunStateInner {
    phase: RunPhase,
    history: Vec<RunPhase>,
    connection: Option<Arc<dyn SourceDatabase>>,
    export_dir: Option<PathBuf>,
    archive: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RunState {
    inner: Mutex<RunStateInner>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RunStateInner {
                phase: RunPhase::Idle,
                history: vec![RunPhase::Idle],
                connection: None,
                export_dir: None,
                archive: None,
            }),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.lock().phase
    }

    /// Every phase the run has entered, in order
    pub fn history(&self) -> Vec<RunPhase> {
        self.inner.lock().history.clone()
    }

    /// Move to `next`; illegal transitions are logged and ignored.
    pub fn advance(&self, next: RunPhase) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.phase;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Ignoring illegal run phase transition");
            return false;
        }
        inner.phase = next;
        inner.history.push(next);
        info!(from = %current, to = %next, "Run phase changed");
        true
    }

    pub fn record_connection(&self, connection: Arc<dyn SourceDatabase>) {
        self.inner.lock().connection = Some(connection);
    }

    pub fn record_export_dir(&self, path: PathBuf) {
        debug!(path = %path.display(), "Export directory owned by run");
        self.inner.lock().export_dir = Some(path);
    }

    pub fn record_archive(&self, path: PathBuf) {
        debug!(path = %path.display(), "Archive owned by run");
        self.inner.lock().archive = Some(path);
    }

    pub fn take_connection(&self) -> Option<Arc<dyn SourceDatabase>> {
        self.inner.lock().connection.take()
    }

    pub fn take_export_dir(&self) -> Option<PathBuf> {
        self.inner.lock().export_dir.take()
    }

    pub fn take_archive(&self) -> Option<PathBuf> {
        self.inner.lock().archive.take()
    }

    pub fn has_connection(&self) -> bool {
        self.inner.lock().connection.is_some()
    }
}

impl StepObserver for RunState {
    fn step_started(&self, step: &str) {
        if let Some(phase) = RunPhase::for_step(step) {
            self.advance(phase);
        }
    }

    fn step_failed(&self, step: &str, error: &ExporterError) {
        debug!(step = step, phase = %self.phase(), error_kind = error.kind(), "Step failed in phase");
    }

    fn step_succeeded(&self, step: &str, elapsed: Duration) {
        debug!(step = step, elapsed_ms = elapsed.as_millis() as u64, "Step settled");
    }
}
