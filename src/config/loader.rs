//! Configuration Loader
//!
//! Layered loading: built-in defaults, then an optional TOML/YAML file, then `EXPORTER__*`
//! environment variables, then `key=value` overrides from the command line. The merged result is
//! validated once and never changes afterwards.

use super::error::{ConfigResult, ConfigurationError};
use super::RunConfiguration;
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default location of the configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/exporter.toml";

/// Environment variable prefix; nested keys use a double underscore (`EXPORTER__SOURCE__HOST`)
pub const ENV_PREFIX: &str = "EXPORTER";

const ENV_SEPARATOR: &str = "__";

/// Owner of the loaded, validated configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: RunConfiguration,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load and validate configuration from every layer.
    ///
    /// A missing file is not an error when `path` is `None`; an explicitly named file must exist.
    pub fn load(path: Option<&Path>, overrides: &[String]) -> ConfigResult<Arc<ConfigManager>> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if required && !file.exists() {
            return Err(ConfigurationError::file_read_error(
                file.display().to_string(),
                "file does not exist",
            ));
        }

        let config = Self::build(Some(&file), overrides, Environment::with_prefix(ENV_PREFIX))?;
        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string(&config.sanitized())
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            mapping = %config.mapping,
            dialect = %config.source.dialect,
            parallel_extracts = config.parallel_extracts,
            compress_format = %config.compress_format,
            "Configuration loaded successfully"
        );

        let config_file = file.exists().then_some(file);
        Ok(Arc::new(ConfigManager {
            config,
            config_file,
        }))
    }

    /// Wrap an already-built configuration, validating it.
    pub fn from_config(config: RunConfiguration) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            config_file: None,
        }))
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// File the configuration was read from, if one existed
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Sanitized snapshot for logging
    pub fn debug_config(&self) -> serde_json::Value {
        self.config.sanitized()
    }

    fn build(
        file: Option<&Path>,
        overrides: &[String],
        environment: Environment,
    ) -> ConfigResult<RunConfiguration> {
        let defaults = Config::try_from(&RunConfiguration::default())
            .map_err(ConfigurationError::load_error)?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(file) = file {
            let name = file.to_string_lossy().to_string();
            builder = builder.add_source(File::with_name(&name).required(false));
        }

        builder = builder.add_source(
            environment
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        for raw in overrides {
            let (key, value) = parse_override(raw)?;
            builder = builder
                .set_override(key, value)
                .map_err(ConfigurationError::load_error)?;
        }

        builder
            .build()
            .map_err(ConfigurationError::load_error)?
            .try_deserialize::<RunConfiguration>()
            .map_err(ConfigurationError::load_error)
    }
}

/// Split a `key=value` override. Keys use dotted paths (`source.host`).
pub fn parse_override(raw: &str) -> ConfigResult<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(ConfigurationError::InvalidOverride {
            raw: raw.to_string(),
            reason: "expected key=value".to_string(),
        });
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigurationError::InvalidOverride {
            raw: raw.to_string(),
            reason: "key is empty".to_string(),
        });
    }

    Ok((key.to_lowercase(), value.trim().to_string()))
}
