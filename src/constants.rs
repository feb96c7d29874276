//! # System Constants
//!
//! Step names, on-disk artifact names and the run phase enum shared by the pipeline, the orphan
//! recovery pass and the tests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names of the production pipeline steps, in dependency order
pub mod steps {
    pub const RECOVER_ORPHANS: &str = "recover_orphans";
    pub const CONNECT: &str = "connect";
    pub const WAIT_FOR_CONNECTION: &str = "wait_for_connection";
    pub const CREATE_EXPORT_DIR: &str = "create_export_dir";
    pub const CHMOD_EXPORT_DIR: &str = "chmod_export_dir";
    pub const LOAD_PREPROCESSOR: &str = "load_preprocessor";
    pub const RUN_PREPROCESSOR: &str = "run_preprocessor";
    pub const LOAD_MAPPING: &str = "load_mapping";
    pub const BUILD_EXPORT_TASKS: &str = "build_export_tasks";
    pub const RUN_EXPORTS: &str = "run_exports";
    pub const WRITE_MAPPING: &str = "write_mapping";
    pub const COMPRESS: &str = "compress";
    pub const READ_PRIVATE_KEY: &str = "read_private_key";
    pub const TRANSFER: &str = "transfer";

    pub const ALL: [&str; 14] = [
        RECOVER_ORPHANS,
        CONNECT,
        WAIT_FOR_CONNECTION,
        CREATE_EXPORT_DIR,
        CHMOD_EXPORT_DIR,
        LOAD_PREPROCESSOR,
        RUN_PREPROCESSOR,
        LOAD_MAPPING,
        BUILD_EXPORT_TASKS,
        RUN_EXPORTS,
        WRITE_MAPPING,
        COMPRESS,
        READ_PRIVATE_KEY,
        TRANSFER,
    ];
}

/// Files written into every export directory
pub mod artifacts {
    /// Written first by the directory-creation step; proves the directory belongs to a run
    pub const RUN_MARKER_FILE: &str = ".exporter-run.json";

    /// Copy of the mapping definition, kept for audit
    pub const MAPPING_FILE: &str = "mapping.json";

    pub const EXPORT_FILE_EXTENSION: &str = "csv";

    /// Suffix of the optional preprocessing statement list next to a mapping file
    pub const PREPROCESS_SUFFIX: &str = "preprocess.json";
}

/// Operational constants
pub mod system {
    /// Interval between transfer progress reports
    pub const TRANSFER_PROGRESS_INTERVAL_SECS: u64 = 5;

    /// Label of the serial preprocessing runner
    pub const PREPROCESS_RUNNER: &str = "preprocess";

    /// Label of the bounded export runner
    pub const EXPORT_RUNNER: &str = "export";

    pub const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;
}

/// Lifecycle of one run
///
/// `CleaningUp` is entered from whichever phase the run had reached once the graph settles, and
/// the run always ends in `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    RecoveringOrphans,
    Connecting,
    AwaitingConnection,
    PreparingDirectory,
    Preprocessing,
    Exporting,
    Archiving,
    Transferring,
    CleaningUp,
    Succeeded,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed)
    }

    /// Phase a pipeline step belongs to
    pub fn for_step(step: &str) -> Option<RunPhase> {
        let phase = match step {
            steps::RECOVER_ORPHANS => RunPhase::RecoveringOrphans,
            steps::CONNECT => RunPhase::Connecting,
            steps::WAIT_FOR_CONNECTION => RunPhase::AwaitingConnection,
            steps::CREATE_EXPORT_DIR | steps::CHMOD_EXPORT_DIR => RunPhase::PreparingDirectory,
            steps::LOAD_PREPROCESSOR | steps::RUN_PREPROCESSOR => RunPhase::Preprocessing,
            steps::LOAD_MAPPING
            | steps::BUILD_EXPORT_TASKS
            | steps::RUN_EXPORTS
            | steps::WRITE_MAPPING => RunPhase::Exporting,
            steps::COMPRESS => RunPhase::Archiving,
            steps::READ_PRIVATE_KEY | steps::TRANSFER => RunPhase::Transferring,
            _ => return None,
        };
        Some(phase)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Succeeded | Failed, _) => false,
            // rejected before anything was acquired
            (Idle, Failed) => true,
            (CleaningUp, Succeeded | Failed) => true,
            (CleaningUp, _) => false,
            (_, CleaningUp) => !matches!(self, Idle),
            (from, to) => (to as u8) == (*from as u8) + 1 || (to as u8) == (*from as u8),
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::RecoveringOrphans => "recovering_orphans",
            RunPhase::Connecting => "connecting",
            RunPhase::AwaitingConnection => "awaiting_connection",
            RunPhase::PreparingDirectory => "preparing_directory",
            RunPhase::Preprocessing => "preprocessing",
            RunPhase::Exporting => "exporting",
            RunPhase::Archiving => "archiving",
            RunPhase::Transferring => "transferring",
            RunPhase::CleaningUp => "cleaning_up",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_has_a_phase() {
        for step in steps::ALL {
            assert!(RunPhase::for_step(step).is_some(), "no phase for {step}");
        }
        assert_eq!(RunPhase::for_step("unknown"), None);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(RunPhase::Idle.can_transition_to(RunPhase::RecoveringOrphans));
        assert!(RunPhase::Exporting.can_transition_to(RunPhase::Archiving));
        assert!(RunPhase::Exporting.can_transition_to(RunPhase::CleaningUp));
        assert!(RunPhase::CleaningUp.can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Exporting));
        assert!(RunPhase::Idle.can_transition_to(RunPhase::Failed));
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Succeeded));
        assert!(!RunPhase::Succeeded.can_transition_to(RunPhase::CleaningUp));
        assert!(!RunPhase::CleaningUp.can_transition_to(RunPhase::Exporting));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RunPhase::Succeeded.is_terminal());
        assert!(RunPhase::Failed.is_terminal());
        assert!(!RunPhase::CleaningUp.is_terminal());
    }
}
