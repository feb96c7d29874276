//! Workspace scaffolding for `db-exporter init`.
//!
//! Creates the directories a run expects and a commented configuration template. Nothing that
//! already exists is touched.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Commented configuration template written to `config/exporter.toml`
pub const CONFIG_TEMPLATE: &str = include_str!("../config/exporter.toml");

/// Directories created under the workspace root
pub const WORKSPACE_DIRS: [&str; 5] = ["ssh", "logs", "working", "mappings", "config"];

/// What `init` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Scaffold a workspace under `root`.
pub fn initialize_workspace(root: &Path) -> Result<InitReport> {
    let mut report = InitReport::default();

    for dir in WORKSPACE_DIRS {
        let path = root.join(dir);
        if path.exists() {
            report.skipped.push(path);
            continue;
        }
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        report.created.push(path);
    }

    let config_path = root.join("config").join("exporter.toml");
    if config_path.exists() {
        report.skipped.push(config_path);
    } else {
        fs::write(&config_path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        report.created.push(config_path);
    }

    info!(
        root = %root.display(),
        created = report.created.len(),
        skipped = report.skipped.len(),
        "Workspace initialized"
    );
    Ok(report)
}

/// Command that generates the SFTP key pair expected by the default configuration.
pub fn keygen_hint(root: &Path) -> String {
    format!(
        "ssh-keygen -t rsa -b 4096 -N '' -f {}",
        root.join("ssh").join("id_rsa").display()
    )
}
