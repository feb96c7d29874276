//! Loading configuration from a file with command line overrides.

use exporter_core::config::{ConfigManager, ConfigurationError};
use exporter_core::ArchiveFormat;
use std::fs;
use tempfile::TempDir;

const CONFIG: &str = r#"
mapping = "clinic"
working_dir = "/srv/exporter/working"
compress_format = "tar"

[source]
dialect = "mysql"
host = "db.internal"
database = "emr"
user = "reader"
password = "hunter2-very-secret"

[target]
host = "uploads.example.org"
"#;

fn write_config(body: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("exporter.toml");
    fs::write(&path, body).unwrap();
    (dir, path)
}

#[test]
fn test_load_file_with_overrides() {
    let (_dir, path) = write_config(CONFIG);
    let manager = ConfigManager::load(
        Some(&path),
        &["parallel_extracts=3".to_string(), "target.port=2222".to_string()],
    )
    .unwrap();

    let config = manager.config();
    assert_eq!(config.mapping, "clinic");
    assert_eq!(config.compress_format, ArchiveFormat::Tar);
    assert_eq!(config.parallel_extracts, 3);
    assert_eq!(config.target.port, 2222);
    assert_eq!(manager.config_file(), Some(path.as_path()));
}

#[test]
fn test_sanitized_snapshot_hides_password() {
    let (_dir, path) = write_config(CONFIG);
    let manager = ConfigManager::load(Some(&path), &[]).unwrap();

    let snapshot = manager.debug_config().to_string();
    assert!(!snapshot.contains("hunter2-very-secret"));
    assert!(snapshot.contains("[MASKED]"));
    assert!(!format!("{:?}", manager.config().source).contains("hunter2"));
}

#[test]
fn test_every_violation_is_reported() {
    let (_dir, path) = write_config(CONFIG);
    let err = ConfigManager::load(
        Some(&path),
        &[
            "parallel_extracts=0".to_string(),
            "working_dir_mode=rwx".to_string(),
            "date_format=%Y/%m".to_string(),
        ],
    )
    .unwrap_err();

    match &err {
        ConfigurationError::ValidationError { errors } => {
            assert_eq!(errors.len(), 3, "{errors:?}");
        }
        other => panic!("expected ValidationError, got {other:?}"),
    }
    assert!(!err.to_string().contains("hunter2"));
}

#[test]
fn test_malformed_override_is_rejected() {
    let (_dir, path) = write_config(CONFIG);
    let err = ConfigManager::load(Some(&path), &["parallel_extracts".to_string()]).unwrap_err();
    assert!(matches!(err, ConfigurationError::InvalidOverride { .. }));
}
