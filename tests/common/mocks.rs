//! In-memory stand-ins for the source database, the connection gateway and the SFTP transport.

use async_trait::async_trait;
use exporter_core::config::SourceConfig;
use exporter_core::database::{
    ConnectionGateway, Dialect, ExportOutput, QueryOutput, SourceDatabase,
};
use exporter_core::transfer::{RemoteTransport, TransferReport, TransferRequest};
use exporter_core::{ExporterError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted source database.
///
/// Every export writes `rows_per_export` quoted CSV rows. A statement containing
/// `fail_marker` fails with a `Query` error, without waiting out `export_delay`.
#[derive(Debug)]
pub struct MockSource {
    pub rows_per_export: u64,
    pub export_delay: Duration,
    pub fail_marker: Option<String>,
    row_overrides: Vec<(String, u64)>,
    refusals_remaining: AtomicUsize,
    fatal_probe: Option<String>,
    pub probes: AtomicUsize,
    pub cleanups: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    pub exports: Mutex<Vec<PathBuf>>,
}

impl MockSource {
    pub fn new(rows_per_export: u64) -> Self {
        Self {
            rows_per_export,
            export_delay: Duration::ZERO,
            fail_marker: None,
            row_overrides: Vec::new(),
            refusals_remaining: AtomicUsize::new(0),
            fatal_probe: None,
            probes: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
            exports: Mutex::new(Vec::new()),
        }
    }

    /// Refuse the first `count` probes
    pub fn refusing(self, count: usize) -> Self {
        self.refusals_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every probe with a non-retryable error
    pub fn with_fatal_probe(mut self, reason: &str) -> Self {
        self.fatal_probe = Some(reason.to_string());
        self
    }

    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    /// Exports whose query contains `marker` write `rows` rows instead
    pub fn with_rows_for(mut self, marker: &str, rows: u64) -> Self {
        self.row_overrides.push((marker.to_string(), rows));
        self
    }

    fn rows_for(&self, select: &str) -> u64 {
        self.row_overrides
            .iter()
            .find(|(marker, _)| select.contains(marker.as_str()))
            .map(|(_, rows)| *rows)
            .unwrap_or(self.rows_per_export)
    }

    pub fn with_export_delay(mut self, delay: Duration) -> Self {
        self.export_delay = delay;
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn check(&self, statement: &str) -> Result<()> {
        match &self.fail_marker {
            Some(marker) if statement.contains(marker.as_str()) => Err(ExporterError::Query(
                format!("syntax error at or near \"{marker}\""),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SourceDatabase for MockSource {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, statement: &str, _params: &[String]) -> Result<QueryOutput> {
        self.statements.lock().push(statement.to_string());
        self.check(statement)?;
        Ok(QueryOutput { rows_affected: 1 })
    }

    async fn export_data(&self, select: &str, destination: &Path) -> Result<ExportOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        // rejected queries fail at once, only real exports take time
        let outcome = match self.check(select) {
            Ok(()) => {
                if !self.export_delay.is_zero() {
                    tokio::time::sleep(self.export_delay).await;
                }
                let rows = self.rows_for(select);
                let body: String = (0..rows)
                    .map(|i| format!("\"{i}\",\"row {i}\"\n"))
                    .collect();
                tokio::fs::write(destination, body)
                    .await
                    .map_err(|e| ExporterError::filesystem("mock export", destination, e))
                    .map(|_| {
                        self.exports.lock().push(destination.to_path_buf());
                        ExportOutput { rows_written: rows }
                    })
            }
            Err(e) => Err(e),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn probe(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fatal_probe {
            return Err(ExporterError::ConnectionFatal(reason.clone()));
        }
        let refused = self
            .refusals_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ExporterError::ConnectionRefused(
                "Connection refused (os error 111)".to_string(),
            ));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`MockSource`]
#[derive(Debug)]
pub struct MockGateway {
    pub source: Arc<MockSource>,
    pub connects: AtomicUsize,
}

impl MockGateway {
    pub fn new(source: Arc<MockSource>) -> Self {
        Self {
            source,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionGateway for MockGateway {
    async fn connect(&self, config: &SourceConfig) -> Result<Arc<dyn SourceDatabase>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        config.dialect.parse::<Dialect>()?;
        Ok(self.source.clone())
    }
}

/// What a [`MockTransport`] observed for one delivery
#[derive(Debug, Clone)]
pub struct DeliveredArchive {
    pub request: TransferRequest,
    /// Entry names read from the archive while it still existed locally
    pub entries: Vec<String>,
}

/// Records deliveries instead of opening an SSH session
#[derive(Debug, Default)]
pub struct MockTransport {
    pub fail_with: Option<String>,
    pub delivered: Mutex<Vec<DeliveredArchive>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<DeliveredArchive> {
        self.delivered.lock().clone()
    }
}

fn archive_entries(path: &Path) -> std::io::Result<Vec<String>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|e| e == "tar") {
        let mut archive = tar::Archive::new(file);
        let mut names = Vec::new();
        for entry in archive.entries()? {
            names.push(entry?.path()?.to_string_lossy().into_owned());
        }
        names.sort();
        return Ok(names);
    }
    let archive = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
    let mut names: Vec<String> = archive.file_names().map(String::from).collect();
    names.sort();
    Ok(names)
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReport> {
        let entries = archive_entries(&request.local_path)
            .map_err(|e| ExporterError::Transfer(format!("unreadable archive: {e}")))?;
        self.delivered.lock().push(DeliveredArchive {
            request: request.clone(),
            entries,
        });

        if let Some(reason) = &self.fail_with {
            return Err(ExporterError::Transfer(reason.clone()));
        }
        Ok(TransferReport {
            remote_path: request.remote_path.clone(),
            bytes: request.size_bytes,
            elapsed: Duration::from_millis(1),
        })
    }
}
