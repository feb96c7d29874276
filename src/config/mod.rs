//! # Exporter Configuration
//!
//! The validated, immutable input of a run. A `RunConfiguration` is built once by the
//! [`ConfigManager`] (defaults, optional file, `EXPORTER__*` environment variables, command
//! line overrides) and then only read.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exporter_core::config::ConfigManager;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load(Some(Path::new("config/exporter.toml")), &[])?;
//! let config = manager.config();
//! println!("exporting mapping {} with {} workers", config.mapping, config.parallel_extracts);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::orchestration::run_layout::RunDirectoryPattern;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Field name fragments whose values are masked in logged configuration snapshots
const SENSITIVE_PATTERNS: [&str; 4] = ["password", "secret", "token", "passphrase"];

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Root configuration for one export run
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Name of the mapping to export (`<mapping_dir>/<mapping>.json`)
    pub mapping: String,

    /// Directory holding mapping and preprocessor files
    pub mapping_dir: PathBuf,

    /// Parent directory of the per-run export directories and archives
    pub working_dir: PathBuf,

    /// Octal permission mode applied to the export directory, e.g. `700`
    pub working_dir_mode: String,

    /// strftime format naming the per-run export directory
    pub date_format: String,

    pub compress_format: ArchiveFormat,

    /// Maximum number of concurrently running export queries
    pub parallel_extracts: usize,

    pub connection_attempts: u32,

    pub connection_interval_ms: u64,

    pub source: SourceConfig,

    pub target: TargetConfig,

    pub logger: LoggerConfig,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            mapping: String::new(),
            mapping_dir: PathBuf::from("mappings"),
            working_dir: PathBuf::from("working"),
            working_dir_mode: "700".to_string(),
            date_format: "%Y_%m_%d_%H_%M_%S".to_string(),
            compress_format: ArchiveFormat::Zip,
            parallel_extracts: 10,
            connection_attempts: 10,
            connection_interval_ms: 1000,
            source: SourceConfig::default(),
            target: TargetConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

/// Source database connection settings
#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Backend tag (`postgres` or `mysql`); resolved by the connection gateway
    pub dialect: String,
    pub host: String,
    /// Falls back to the dialect's standard port
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Upper bound of pooled connections shared by preprocessing and export tasks
    pub pool_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dialect: "postgres".to_string(),
            host: "localhost".to_string(),
            port: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            pool_size: 10,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[MASKED]")
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// Remote SFTP endpoint settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Path of the private key file used to authenticate
    pub private_key: PathBuf,
    /// Remote directory receiving the archive (POSIX path)
    pub path: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "exporter".to_string(),
            private_key: PathBuf::from("ssh/id_rsa"),
            path: "/hdc/crypt/uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub directory: PathBuf,
    pub filename: String,
    /// Write the file layer as JSON lines
    pub json: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("logs"),
            filename: "exporter.log".to_string(),
            json: true,
        }
    }
}

/// Archive container written before transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
        }
    }

    pub fn all() -> [ArchiveFormat; 2] {
        [ArchiveFormat::Zip, ArchiveFormat::Tar]
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl RunConfiguration {
    /// Check every rule and report all violations together.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        let mut require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                errors.push(format!("'{field}' is required"));
            }
        };
        require(&self.mapping, "mapping");
        require(&self.working_dir.to_string_lossy(), "working_dir");
        require(&self.mapping_dir.to_string_lossy(), "mapping_dir");
        require(&self.source.host, "source.host");
        require(&self.source.database, "source.database");
        require(&self.source.user, "source.user");
        require(&self.source.password, "source.password");
        require(&self.target.host, "target.host");
        require(&self.target.username, "target.username");
        require(&self.target.path, "target.path");
        require(&self.target.private_key.to_string_lossy(), "target.private_key");

        if self.parallel_extracts == 0 {
            errors.push("'parallel_extracts' must be at least 1".to_string());
        }
        if self.connection_attempts == 0 {
            errors.push("'connection_attempts' must be at least 1".to_string());
        }
        if self.connection_interval_ms == 0 {
            errors.push("'connection_interval_ms' must be at least 1".to_string());
        }
        if self.source.pool_size == 0 {
            errors.push("'source.pool_size' must be at least 1".to_string());
        }

        if self.directory_mode().is_none() {
            errors.push(format!(
                "'working_dir_mode' must be three octal digits, got '{}'",
                self.working_dir_mode
            ));
        }

        if let Err(e) = RunDirectoryPattern::compile(&self.date_format) {
            errors.push(format!("'date_format' is not usable for run directories: {e}"));
        }

        if !LOG_LEVELS.contains(&self.logger.level.to_lowercase().as_str()) {
            errors.push(format!(
                "'logger.level' must be one of {}, got '{}'",
                LOG_LEVELS.join("|"),
                self.logger.level
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::ValidationError { errors })
        }
    }

    /// Parsed `working_dir_mode`, `None` unless it is exactly three octal digits.
    pub fn directory_mode(&self) -> Option<u32> {
        let mode = self.working_dir_mode.as_str();
        if mode.len() != 3 || !mode.chars().all(|c| ('0'..='7').contains(&c)) {
            return None;
        }
        u32::from_str_radix(mode, 8).ok()
    }

    /// JSON snapshot of the configuration with secrets masked, safe to log.
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::json!(self);
        sanitize_json_recursive(&mut value);
        value
    }
}

fn sanitize_json_recursive(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = SENSITIVE_PATTERNS
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if is_sensitive {
                    *val = match val {
                        serde_json::Value::String(s) if s.is_empty() => {
                            serde_json::Value::String("[EMPTY]".to_string())
                        }
                        _ => serde_json::Value::String("[MASKED]".to_string()),
                    };
                } else {
                    sanitize_json_recursive(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                sanitize_json_recursive(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RunConfiguration {
        RunConfiguration {
            mapping: "clinic".to_string(),
            source: SourceConfig {
                database: "emr".to_string(),
                user: "reader".to_string(),
                password: "s3cr3t-value".to_string(),
                ..SourceConfig::default()
            },
            target: TargetConfig {
                host: "uploads.example.org".to_string(),
                ..TargetConfig::default()
            },
            ..RunConfiguration::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = valid_config();
        config.mapping.clear();
        config.parallel_extracts = 0;
        config.working_dir_mode = "800".to_string();
        config.logger.level = "verbose".to_string();

        let err = config.validate().unwrap_err();
        match err {
            ConfigurationError::ValidationError { errors } => {
                assert_eq!(errors.len(), 4, "unexpected errors: {errors:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_directory_mode_parses_octal() {
        let mut config = valid_config();
        assert_eq!(config.directory_mode(), Some(0o700));
        config.working_dir_mode = "755".to_string();
        assert_eq!(config.directory_mode(), Some(0o755));
        config.working_dir_mode = "0700".to_string();
        assert_eq!(config.directory_mode(), None);
        config.working_dir_mode = "7a0".to_string();
        assert_eq!(config.directory_mode(), None);
    }

    #[test]
    fn test_date_format_with_text_specifier_is_rejected() {
        let mut config = valid_config();
        config.date_format = "%Y_%b_%d".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanitized_masks_password() {
        let snapshot = valid_config().sanitized();
        assert_eq!(snapshot["source"]["password"], "[MASKED]");
        assert_eq!(snapshot["source"]["user"], "reader");
        assert!(!snapshot.to_string().contains("s3cr3t-value"));
    }

    #[test]
    fn test_debug_output_masks_password() {
        let rendered = format!("{:?}", valid_config());
        assert!(!rendered.contains("s3cr3t-value"));
        assert!(rendered.contains("[MASKED]"));
    }

    #[test]
    fn test_archive_format_extensions() {
        assert_eq!(ArchiveFormat::Zip.extension(), "zip");
        assert_eq!(ArchiveFormat::Tar.to_string(), "tar");
    }
}
