//! # Mappings
//!
//! A mapping names what a run exports: an ordered list of `{target, query}` entries, plus an
//! optional ordered list of preprocessing statements run before any export.
//!
//! On disk a mapping called `clinic` is `<mapping_dir>/clinic.json`:
//!
//! ```json
//! [
//!   { "target": "patients", "query": "SELECT * FROM patients" },
//!   { "target": "visits", "query": "SELECT * FROM visits WHERE closed" }
//! ]
//! ```
//!
//! and its preprocessing statements, if any, are `<mapping_dir>/clinic.preprocess.json`, a JSON
//! array of SQL strings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::artifacts::PREPROCESS_SUFFIX;
use crate::error::{ExporterError, Result};

/// One exported query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Label used in the export file name (`<target>.<index>.csv`)
    pub target: String,
    pub query: String,
}

/// A parsed mapping together with the document it was parsed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub name: String,
    pub entries: Vec<MappingEntry>,
    /// Original document, copied verbatim into the export directory
    pub raw: String,
}

impl Mapping {
    /// Parse and validate a mapping document.
    pub fn parse(name: impl Into<String>, raw: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let raw = raw.into();
        let entries: Vec<MappingEntry> = serde_json::from_str(&raw).map_err(|e| {
            ExporterError::Configuration(format!("Mapping '{name}' is not valid JSON: {e}"))
        })?;

        let mapping = Self { name, entries, raw };
        mapping.validate()?;
        Ok(mapping)
    }

    fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ExporterError::Configuration(format!(
                "Mapping '{}' has no entries",
                self.name
            )));
        }

        let mut errors = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.target.trim().is_empty() {
                errors.push(format!("entry {index} has an empty target"));
            } else if !is_safe_target(&entry.target) {
                errors.push(format!(
                    "entry {index} target '{}' must not contain path separators",
                    entry.target
                ));
            }
            if entry.query.trim().is_empty() {
                errors.push(format!("entry {index} has an empty query"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExporterError::Configuration(format!(
                "Mapping '{}' is invalid: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_safe_target(target: &str) -> bool {
    !target.contains('/') && !target.contains('\\') && target != "." && target != ".."
}

/// Where mappings and preprocessing statements come from
#[async_trait]
pub trait MappingSource: Send + Sync + fmt::Debug {
    /// Ordered preprocessing statements for `name`; empty when there are none.
    async fn load_preprocessor(&self, name: &str) -> Result<Vec<String>>;

    async fn load_mapping(&self, name: &str) -> Result<Mapping>;

    /// Cheap existence check run before a run starts.
    async fn check_mapping(&self, name: &str) -> Result<()>;
}

/// Mappings stored as JSON files in one directory
#[derive(Debug, Clone)]
pub struct MappingDirectory {
    root: PathBuf,
}

impl MappingDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mapping_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    pub fn preprocessor_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{PREPROCESS_SUFFIX}"))
    }

    fn check_name(name: &str) -> Result<()> {
        if name.trim().is_empty() || !is_safe_target(name) {
            return Err(ExporterError::Configuration(format!(
                "Invalid mapping name '{name}'"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MappingSource for MappingDirectory {
    async fn load_preprocessor(&self, name: &str) -> Result<Vec<String>> {
        Self::check_name(name)?;
        let path = self.preprocessor_path(name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No preprocessor for mapping");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ExporterError::filesystem("read preprocessor", &path, e)),
        };

        let statements: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
            ExporterError::Configuration(format!(
                "Preprocessor '{}' must be a JSON array of statements: {e}",
                path.display()
            ))
        })?;
        Ok(statements
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect())
    }

    async fn load_mapping(&self, name: &str) -> Result<Mapping> {
        Self::check_name(name)?;
        let path = self.mapping_path(name);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ExporterError::Configuration(format!(
                    "Mapping '{name}' not found at {}",
                    path.display()
                ))
            } else {
                ExporterError::filesystem("read mapping", &path, e)
            }
        })?;
        Mapping::parse(name, raw)
    }

    async fn check_mapping(&self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let path = self.mapping_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(ExporterError::Configuration(format!(
                "Mapping '{name}' not found at {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CLINIC: &str = r#"[
        {"target": "patients", "query": "SELECT * FROM patients"},
        {"target": "visits", "query": "SELECT * FROM visits"}
    ]"#;

    #[test]
    fn test_parse_keeps_order_and_raw_document() {
        let mapping = Mapping::parse("clinic", CLINIC).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.entries[0].target, "patients");
        assert_eq!(mapping.entries[1].target, "visits");
        assert_eq!(mapping.raw, CLINIC);
    }

    #[test]
    fn test_empty_mapping_is_rejected() {
        let err = Mapping::parse("empty", "[]").unwrap_err();
        assert!(matches!(err, ExporterError::Configuration(_)));
    }

    #[test]
    fn test_target_with_separator_is_rejected() {
        let raw = r#"[{"target": "../etc", "query": "SELECT 1"}]"#;
        let err = Mapping::parse("bad", raw).unwrap_err();
        assert!(err.to_string().contains("path separators"));
    }

    #[tokio::test]
    async fn test_directory_loads_mapping_and_preprocessor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clinic.json"), CLINIC).unwrap();
        std::fs::write(
            dir.path().join("clinic.preprocess.json"),
            r#"["REFRESH MATERIALIZED VIEW visits_mv", "ANALYZE visits"]"#,
        )
        .unwrap();

        let source = MappingDirectory::new(dir.path());
        source.check_mapping("clinic").await.unwrap();
        assert_eq!(source.load_mapping("clinic").await.unwrap().len(), 2);
        assert_eq!(
            source.load_preprocessor("clinic").await.unwrap(),
            vec!["REFRESH MATERIALIZED VIEW visits_mv", "ANALYZE visits"]
        );
    }

    #[tokio::test]
    async fn test_missing_preprocessor_means_no_statements() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clinic.json"), CLINIC).unwrap();
        let source = MappingDirectory::new(dir.path());
        assert!(source.load_preprocessor("clinic").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_mapping_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let source = MappingDirectory::new(dir.path());
        assert!(matches!(
            source.check_mapping("absent").await.unwrap_err(),
            ExporterError::Configuration(_)
        ));
        assert!(matches!(
            source.load_mapping("absent").await.unwrap_err(),
            ExporterError::Configuration(_)
        ));
    }
}
