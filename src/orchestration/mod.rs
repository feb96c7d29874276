//! # Orchestration Engine
//!
//! Runs one export as a dependency graph of steps and guarantees that whatever the run created
//! locally is gone when it returns.
//!
//! ## Core Components
//!
//! - **TaskGraph**: generic named-step DAG executor with transitive result passing
//! - **BoundedParallelRunner**: runs a batch of async tasks with at most `limit` in flight
//! - **OrphanRecovery**: removes run directories left behind by crashed runs
//! - **RunLayout**: names the export directory, archive and remote file of a run
//! - **RunState**: tracks the run phase and the resources finalization must release
//! - **ExportPipeline**: wires the production steps together and finalizes
//!
//! ## Run Phases
//!
//! ```text
//! Idle -> RecoveringOrphans -> Connecting -> AwaitingConnection -> PreparingDirectory
//!      -> Preprocessing -> Exporting -> Archiving -> Transferring -> CleaningUp
//!      -> Succeeded | Failed
//! ```

pub mod orphan_recovery;
pub mod parallel_runner;
pub mod pipeline;
pub mod run_layout;
pub mod run_state;
pub mod task_graph;
pub mod types;

pub use orphan_recovery::{OrphanCandidate, OrphanRecovery, RecoveryReport, RunMarker};
pub use parallel_runner::{BoundedParallelRunner, RunnerReport};
pub use pipeline::{ExportPipeline, StepOutput};
pub use run_layout::{posix_join, RunDirectoryPattern, RunLayout};
pub use run_state::RunState;
pub use task_graph::{
    GraphOutcome, NoopObserver, StepInputs, StepObserver, TaskGraph, TaskGraphBuilder,
};
pub use types::{ArchiveInfo, ExportTask, RunSummary, TaskMetrics};
