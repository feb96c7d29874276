//! # Orphan Recovery
//!
//! A run that is killed before its cleanup leaves its export directory (and maybe its archive)
//! in the working directory. Before a new run connects to anything, this pass lists the working
//! directory and removes what can be proven to be such a leftover.
//!
//! A directory is deleted only when all of these hold:
//! 1. it is a directory (symlinks are never followed)
//! 2. its name matches the pattern compiled from the date format
//! 3. it contains the run marker file every run writes right after creating its directory
//!
//! Matching directories without a marker are preserved and logged: they may belong to a run
//! still creating its directory. Failures are collected and reported together after every entry
//! has been tried; they never block the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ArchiveFormat, RunConfiguration};
use crate::constants::artifacts::RUN_MARKER_FILE;
use crate::error::{ExporterError, Result};
use crate::orchestration::run_layout::RunDirectoryPattern;

/// Contents of the run marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub mapping: String,
}

impl RunMarker {
    pub fn new(run_id: Uuid, mapping: impl Into<String>) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            pid: std::process::id(),
            mapping: mapping.into(),
        }
    }

    /// Write the marker into `dir`.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(RUN_MARKER_FILE);
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| ExporterError::Configuration(format!("run marker encoding: {e}")))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ExporterError::filesystem("write run marker", &path, e))?;
        Ok(path)
    }
}

/// One entry of the working directory, evaluated against the deletion rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    pub path: PathBuf,
    pub is_directory: bool,
    pub matches_naming_pattern: bool,
    pub contains_sentinel_file: bool,
}

impl OrphanCandidate {
    pub fn is_deletable(&self) -> bool {
        self.is_directory && self.matches_naming_pattern && self.contains_sentinel_file
    }
}

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries examined
    pub scanned: usize,
    /// Deleted orphan directories and archives
    pub deleted: Vec<PathBuf>,
    /// Matching directories kept because they had no marker
    pub preserved: Vec<PathBuf>,
    /// `path: reason` for every entry that could not be checked or deleted
    pub failures: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(OrphanCheck)` when any entry failed.
    pub fn into_result(self) -> Result<RecoveryReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ExporterError::OrphanCheck {
                failures: self.failures,
            })
        }
    }

    fn fail(&mut self, path: &Path, reason: impl std::fmt::Display) {
        self.failures.push(format!("{}: {reason}", path.display()));
    }
}

#[derive(Debug, Clone)]
pub struct OrphanRecovery {
    parent: PathBuf,
    pattern: RunDirectoryPattern,
}

impl OrphanRecovery {
    pub fn new(parent: impl Into<PathBuf>, pattern: RunDirectoryPattern) -> Self {
        Self {
            parent: parent.into(),
            pattern,
        }
    }

    pub fn from_config(config: &RunConfiguration) -> Result<Self> {
        Ok(Self::new(
            config.working_dir.clone(),
            RunDirectoryPattern::compile(&config.date_format)?,
        ))
    }

    pub fn parent(&self) -> &Path {
        &self.parent
    }

    /// Evaluate one path against the deletion rules.
    pub async fn inspect(&self, path: &Path) -> io::Result<OrphanCandidate> {
        let metadata = tokio::fs::symlink_metadata(path).await?;
        let is_directory = metadata.is_dir();
        let matches_naming_pattern = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.pattern.is_match(n));

        let contains_sentinel_file = if is_directory && matches_naming_pattern {
            match tokio::fs::symlink_metadata(path.join(RUN_MARKER_FILE)).await {
                Ok(marker) => marker.is_file(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        Ok(OrphanCandidate {
            path: path.to_path_buf(),
            is_directory,
            matches_naming_pattern,
            contains_sentinel_file,
        })
    }

    /// Scan the working directory and delete every provable orphan.
    ///
    /// Never fails as a whole; problems end up in [`RecoveryReport::failures`].
    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let mut entries = match tokio::fs::read_dir(&self.parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(parent = %self.parent.display(), "Working directory absent, nothing to recover");
                return report;
            }
            Err(e) => {
                error!(parent = %self.parent.display(), error = %e, "Orphan Check Failure");
                report.fail(&self.parent, e);
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(parent = %self.parent.display(), error = %e, "Failed to read directory entry");
                    report.fail(&self.parent, e);
                    break;
                }
            };
            report.scanned += 1;
            let path = entry.path();

            let candidate = match self.inspect(&path).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Orphan Check Failure");
                    report.fail(&path, e);
                    continue;
                }
            };

            if !candidate.is_directory || !candidate.matches_naming_pattern {
                continue;
            }

            if !candidate.contains_sentinel_file {
                info!(
                    path = %path.display(),
                    marker = RUN_MARKER_FILE,
                    "Orphan Directory Preserved: no run marker"
                );
                report.preserved.push(path);
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Orphan Directory Deleted");
                    report.deleted.push(path.clone());
                    self.remove_sibling_archives(&path, &mut report).await;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Orphan Delete Failure");
                    report.fail(&path, e);
                }
            }
        }

        report
    }

    // Archives are only reclaimed next to a marked directory. A crash after finalization has
    // deleted the directory but before it deletes the archive leaves the archive behind for good:
    // an archive carries no marker, and deleting bare timestamp-named files would reach files
    // this tool never created.
    async fn remove_sibling_archives(&self, dir: &Path, report: &mut RecoveryReport) {
        for format in ArchiveFormat::all() {
            let mut archive = dir.as_os_str().to_os_string();
            archive.push(".");
            archive.push(format.extension());
            let archive = PathBuf::from(archive);

            match tokio::fs::remove_file(&archive).await {
                Ok(()) => {
                    info!(path = %archive.display(), "Orphan Archive Deleted");
                    report.deleted.push(archive);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(path = %archive.display(), error = %e, "Orphan Delete Failure");
                    report.fail(&archive, e);
                }
            }
        }
    }
}
