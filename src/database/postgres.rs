//! PostgreSQL backend.
//!
//! Exports use a server-side `COPY (<select>) TO '<file>'`, so the destination must be a path
//! the database server can write to and the role needs `pg_write_server_files`.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{trim_statement, Dialect, ExportOutput, QueryOutput, SourceDatabase, PROBE_STATEMENT};
use crate::config::SourceConfig;
use crate::error::Result;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PostgresSource {
    pool: PgPool,
    connect_options: PgConnectOptions,
}

impl PostgresSource {
    pub fn new(config: &SourceConfig) -> Self {
        let connect_options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port.unwrap_or_else(|| Dialect::Postgres.default_port()))
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .application_name("db-exporter");

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options.clone());

        Self {
            pool,
            connect_options,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Server-side CSV export of `select` into `destination`
    pub fn copy_statement(select: &str, destination: &Path) -> String {
        format!(
            "COPY ({}) TO '{}' WITH (FORMAT csv, FORCE_QUOTE *, DELIMITER ',', NULL '\\N', ENCODING 'LATIN1', ESCAPE '\\')",
            trim_statement(select),
            quote_literal(&destination.to_string_lossy())
        )
    }
}

/// Body of a standard-conforming string literal: only single quotes need doubling.
fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[async_trait]
impl SourceDatabase for PostgresSource {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        let statement = Self::copy_statement(select, destination);
        debug!(destination = %destination.display(), "Running COPY export");
        // rows_affected is parsed from the `COPY n` command tag
        let result = sqlx::raw_sql(&statement).execute(&self.pool).await?;
        Ok(ExportOutput {
            rows_written: result.rows_affected(),
        })
    }

    /// A dedicated connection, so a refusal surfaces as such instead of a pool timeout.
    async fn probe(&self) -> Result<()> {
        let mut conn = PgConnection::connect_with(&self.connect_options).await?;
        sqlx::query(PROBE_STATEMENT).execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
