//! # Run Layout
//!
//! Names every artifact a run creates. The export directory is named by formatting the run's
//! start time with the configured date format; the same format compiles into the regex orphan
//! recovery uses to recognize directories left behind by earlier runs.

use chrono::{DateTime, TimeZone};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RunConfiguration;
use crate::error::{ExporterError, Result};

/// Compiled form of a run directory date format
#[derive(Debug, Clone)]
pub struct RunDirectoryPattern {
    format: String,
    regex: Regex,
}

impl RunDirectoryPattern {
    /// Compile `format` into an anchored regex.
    ///
    /// Only fixed-width numeric specifiers are accepted (`%Y %y %m %d %H %M %S %j`, plus `%%`),
    /// each mapping to a digit class of its width. Every other character is a literal.
    pub fn compile(format: &str) -> Result<Self> {
        if format.is_empty() {
            return Err(ExporterError::Configuration(
                "date format must not be empty".to_string(),
            ));
        }

        let mut pattern = String::from("^");
        let mut specifiers = 0usize;
        let mut chars = format.chars();

        while let Some(c) = chars.next() {
            match c {
                '%' => {
                    let token = match chars.next() {
                        Some('Y') => r"\d{4}",
                        Some('y' | 'm' | 'd' | 'H' | 'M' | 'S') => r"\d{2}",
                        Some('j') => r"\d{3}",
                        Some('%') => "%",
                        Some(other) => {
                            return Err(ExporterError::Configuration(format!(
                                "date format specifier '%{other}' is not supported"
                            )))
                        }
                        None => {
                            return Err(ExporterError::Configuration(
                                "date format ends with a dangling '%'".to_string(),
                            ))
                        }
                    };
                    if token != "%" {
                        specifiers += 1;
                    }
                    pattern.push_str(token);
                }
                '/' | '\\' => {
                    return Err(ExporterError::Configuration(format!(
                        "date format '{format}' must not contain path separators"
                    )))
                }
                literal => pattern.push_str(&regex::escape(&literal.to_string())),
            }
        }
        pattern.push('$');

        if specifiers == 0 {
            return Err(ExporterError::Configuration(format!(
                "date format '{format}' contains no date specifiers"
            )));
        }

        let regex = Regex::new(&pattern).map_err(|e| {
            ExporterError::Configuration(format!("date format '{format}' did not compile: {e}"))
        })?;

        Ok(Self {
            format: format.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn regex(&self) -> &str {
        self.regex.as_str()
    }

    /// Directory name for a run started at `at`.
    pub fn render<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        // compile() admits only numeric specifiers, so formatting cannot fail
        at.format(&self.format).to_string()
    }
}

/// Every local and remote path of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    /// Formatted run start time; the export directory's name
    pub timestamp: String,
    /// `<working_dir>/<timestamp>`
    pub export_dir: PathBuf,
    /// `<working_dir>/<timestamp>.<format>`
    pub archive_path: PathBuf,
    /// `<target.path>/<timestamp>.<format>` on the remote host
    pub remote_path: String,
}

impl RunLayout {
    pub fn new(config: &RunConfiguration, timestamp: impl Into<String>) -> Self {
        let timestamp = timestamp.into();
        let archive_name = format!("{timestamp}.{}", config.compress_format.extension());
        Self {
            export_dir: config.working_dir.join(&timestamp),
            archive_path: config.working_dir.join(&archive_name),
            remote_path: posix_join(&config.target.path, &archive_name),
            timestamp,
        }
    }

    /// Destination file of the export task at `index`.
    pub fn export_file(&self, target: &str, index: usize) -> PathBuf {
        export_file_in(&self.export_dir, target, index)
    }
}

pub(crate) fn export_file_in(dir: &Path, target: &str, index: usize) -> PathBuf {
    dir.join(format!(
        "{target}.{index}.{}",
        crate::constants::artifacts::EXPORT_FILE_EXTENSION
    ))
}

/// Join remote path segments with `/`, whatever the local platform.
pub fn posix_join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        }
    } else {
        format!("{base}/{}", name.trim_start_matches('/'))
    }
}
