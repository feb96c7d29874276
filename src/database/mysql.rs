//! MySQL backend. Exports use `SELECT ... INTO OUTFILE`, written by the server, so the account
//! needs the `FILE` privilege and `secure_file_priv` must allow the working directory.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{Connection, MySqlConnection, MySqlPool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{trim_statement, Dialect, ExportOutput, QueryOutput, SourceDatabase, PROBE_STATEMENT};
use crate::config::SourceConfig;
use crate::error::Result;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
    connect_options: MySqlConnectOptions,
}

impl MySqlSource {
    pub fn new(config: &SourceConfig) -> Self {
        let connect_options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port.unwrap_or_else(|| Dialect::MySql.default_port()))
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options.clone());

        Self {
            pool,
            connect_options,
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn outfile_statement(select: &str, destination: &Path) -> String {
        format!(
            "{} INTO OUTFILE '{}' FIELDS TERMINATED BY ',' ENCLOSED BY '\"' LINES TERMINATED BY '\\n'",
            trim_statement(select),
            quote_literal(&destination.to_string_lossy())
        )
    }
}

/// MySQL treats backslash as an escape inside string literals by default.
fn quote_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl SourceDatabase for MySqlSource {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn query(&self, statement: &str, params: &[String]) -> Result<QueryOutput> {
        let result = if params.is_empty() {
            sqlx::raw_sql(statement).execute(&self.pool).await?
        } else {
            let mut query = sqlx::query(statement);
            for param in params {
                query = query.bind(param.as_str());
            }
            query.execute(&self.pool).await?
        };
        Ok(QueryOutput {
            rows_affected: result.rows_affected(),
        })
    }

    async fn export_data(&self, select: &str, destination: &Path) -> Result<ExportOutput> {
        let statement = Self::outfile_statement(select, destination);
        debug!(destination = %destination.display(), "Running INTO OUTFILE export");
        let result = sqlx::raw_sql(&statement).execute(&self.pool).await?;
        Ok(ExportOutput {
            rows_written: result.rows_affected(),
        })
    }

    async fn probe(&self) -> Result<()> {
        let mut conn = MySqlConnection::connect_with(&self.connect_options).await?;
        sqlx::query(PROBE_STATEMENT).execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
