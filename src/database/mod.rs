//! # Source Database Access
//!
//! The exporter talks to its source database through the [`SourceDatabase`] capability trait.
//! Each supported backend is one implementation, selected by the [`Dialect`] enum; adding a
//! backend means adding an implementation and a variant, never widening a dispatch elsewhere.
//!
//! ## Key Components
//!
//! - [`SourceDatabase`] - `query`, `export_data`, `probe` and `cleanup` on a pooled handle
//! - [`ConnectionGateway`] - turns a [`SourceConfig`] into a handle
//! - [`postgres`] / [`mysql`] - the concrete backends
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use exporter_core::config::SourceConfig;
//! use exporter_core::database::{ConnectionGateway, DialectGateway};
//! use std::path::Path;
//!
//! # async fn example(config: &SourceConfig) -> exporter_core::Result<()> {
//! let db = DialectGateway.connect(config).await?;
//! db.probe().await?;
//! let output = db.export_data("SELECT * FROM patients", Path::new("/srv/export/patients.0.csv")).await?;
//! println!("wrote {} rows", output.rows_written);
//! db.cleanup().await?;
//! # Ok(())
//! # }
//! ```

pub mod mysql;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::SourceConfig;
use crate::error::{ExporterError, Result};

pub use mysql::MySqlSource;
pub use postgres::PostgresSource;

/// Statement used to prove a connection is usable
pub const PROBE_STATEMENT: &str = "SELECT 1";

/// Result of a statement run through [`SourceDatabase::query`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows_affected: u64,
}

/// Result of [`SourceDatabase::export_data`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutput {
    pub rows_written: u64,
}

/// A pooled handle on one source database.
///
/// Handles are shared by every preprocessing and export task of a run and must tolerate
/// concurrent use up to the configured pool size.
#[async_trait]
pub trait SourceDatabase: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Run a statement. Without params the text may hold several `;`-separated statements.
    async fn query(&self, statement: &str, params: &[String]) -> Result<QueryOutput>;

    /// Export the rows of `select` as CSV into `destination`.
    async fn export_data(&self, select: &str, destination: &Path) -> Result<ExportOutput>;

    /// Issue a trivial statement to prove the database is reachable.
    async fn probe(&self) -> Result<()> {
        self.query(PROBE_STATEMENT, &[]).await.map(|_| ())
    }

    /// Close the pool. Called exactly once, at the end of a run.
    async fn cleanup(&self) -> Result<()>;
}

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::MySql => 3306,
        }
    }

    /// Build the backend for this dialect. The pool connects lazily, so nothing touches the
    /// network until the first probe.
    pub fn open(&self, config: &SourceConfig) -> Arc<dyn SourceDatabase> {
        match self {
            Dialect::Postgres => Arc::new(PostgresSource::new(config)),
            Dialect::MySql => Arc::new(MySqlSource::new(config)),
        }
    }
}

impl FromStr for Dialect {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            other => Err(ExporterError::Configuration(format!(
                "Unsupported dialect '{other}' (expected postgres or mysql)"
            ))),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => f.write_str("postgres"),
            Dialect::MySql => f.write_str("mysql"),
        }
    }
}

/// Obtains a database handle for a run
#[async_trait]
pub trait ConnectionGateway: Send + Sync + fmt::Debug {
    async fn connect(&self, config: &SourceConfig) -> Result<Arc<dyn SourceDatabase>>;
}

/// Production gateway: resolves the dialect tag and opens the matching backend
#[derive(Debug, Clone, Copy, Default)]
pub struct DialectGateway;

#[async_trait]
impl ConnectionGateway for DialectGateway {
    async fn connect(&self, config: &SourceConfig) -> Result<Arc<dyn SourceDatabase>> {
        let dialect: Dialect = config.dialect.parse()?;
        info!(
            dialect = %dialect,
            host = %config.host,
            port = config.port.unwrap_or_else(|| dialect.default_port()),
            database = %config.database,
            pool_size = config.pool_size,
            "Opening source database pool"
        );
        Ok(dialect.open(config))
    }
}

/// Drop trailing semicolons and whitespace so a select can be embedded in a larger statement.
pub(crate) fn trim_statement(select: &str) -> &str {
    select.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}
