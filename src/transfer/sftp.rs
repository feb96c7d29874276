//! SFTP delivery of the run archive.
//!
//! A single attempt: connect, authenticate with the private key, stream the file through a
//! [`ProgressReader`] into a remote write handle. Any failure is a [`ExporterError::Transfer`].

use async_trait::async_trait;
use ssh2::Session;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::constants::system::{BYTES_PER_MEGABYTE, TRANSFER_PROGRESS_INTERVAL_SECS};
use crate::error::{ExporterError, Result};

/// Private key material, never printed
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let pem = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExporterError::filesystem("read private key", path, e))?;
        if pem.trim().is_empty() {
            return Err(ExporterError::Configuration(format!(
                "private key file '{}' is empty",
                path.display()
            )));
        }
        Ok(Self(pem))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([MASKED])")
    }
}

/// Everything needed to deliver one archive
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Absolute POSIX path of the file to create on the remote host
    pub remote_path: String,
    pub private_key: Arc<PrivateKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub remote_path: String,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// One progress observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
    pub percentage: f64,
    /// Rate over the last sampling interval
    pub bytes_per_sec: f64,
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Delivers the archive to the remote endpoint
#[async_trait]
pub trait RemoteTransport: Send + Sync + fmt::Debug {
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReport>;
}

/// ssh2-backed transport; the blocking session runs on the blocking pool
#[derive(Clone)]
pub struct SftpTransport {
    progress_interval: Duration,
    on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for SftpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpTransport")
            .field("progress_interval", &self.progress_interval)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl Default for SftpTransport {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(TRANSFER_PROGRESS_INTERVAL_SECS),
            on_progress: None,
        }
    }
}

impl SftpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    fn transfer_blocking(&self, request: &TransferRequest) -> Result<TransferReport> {
        let start = Instant::now();
        let transfer_err = |stage: &str, e: &dyn fmt::Display| {
            ExporterError::Transfer(format!(
                "{stage} ({}@{}:{}): {e}",
                request.username, request.host, request.port
            ))
        };

        let tcp = TcpStream::connect((request.host.as_str(), request.port))
            .map_err(|e| transfer_err("connect", &e))?;
        let mut session = Session::new().map_err(|e| transfer_err("session", &e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| transfer_err("handshake", &e))?;
        session
            .userauth_pubkey_memory(&request.username, None, request.private_key.expose(), None)
            .map_err(|e| transfer_err("authentication", &e))?;
        if !session.authenticated() {
            return Err(transfer_err("authentication", &"rejected by server"));
        }
        debug!(host = %request.host, "SFTP session authenticated");

        let sftp = session.sftp().map_err(|e| transfer_err("sftp subsystem", &e))?;
        let mut remote = sftp
            .create(Path::new(&request.remote_path))
            .map_err(|e| transfer_err("open remote file", &e))?;

        let local = File::open(&request.local_path)
            .map_err(|e| ExporterError::filesystem("open archive", &request.local_path, e))?;
        let mut reader = ProgressReader::new(local, request.size_bytes, self.progress_interval);
        if let Some(callback) = &self.on_progress {
            reader = reader.with_callback(callback.clone());
        }

        let bytes = upload(&mut reader, &mut remote).map_err(|(stage, e)| transfer_err(stage, &e))?;
        drop(remote);
        drop(sftp);

        if let Err(e) = session.disconnect(None, "transfer complete", None) {
            debug!(error = %e, "SFTP disconnect failed after a completed transfer");
        }

        Ok(TransferReport {
            remote_path: request.remote_path.clone(),
            bytes,
            elapsed: start.elapsed(),
        })
    }
}

/// Remote write handle. Some servers only report a failed write when the handle is closed.
trait RemoteFile: Write {
    fn close_remote(&mut self) -> std::result::Result<(), String>;
}

impl RemoteFile for ssh2::File {
    fn close_remote(&mut self) -> std::result::Result<(), String> {
        self.close().map_err(|e| e.to_string())
    }
}

/// Copy, flush and close; on failure returns the stage that failed.
fn upload<R: Read, F: RemoteFile>(
    reader: &mut R,
    remote: &mut F,
) -> std::result::Result<u64, (&'static str, String)> {
    let bytes = io::copy(reader, remote).map_err(|e| ("write", e.to_string()))?;
    remote.flush().map_err(|e| ("flush", e.to_string()))?;
    remote.close_remote().map_err(|e| ("close remote file", e))?;
    Ok(bytes)
}

#[async_trait]
impl RemoteTransport for SftpTransport {
    async fn transfer(&self, request: TransferRequest) -> Result<TransferReport> {
        let transport = self.clone();
        tokio::task::spawn_blocking(move || transport.transfer_blocking(&request))
            .await
            .map_err(|e| ExporterError::TaskPanicked(format!("transfer task: {e}")))?
    }
}

/// `Read` adapter reporting progress at a fixed interval
pub struct ProgressReader<R> {
    inner: R,
    total: u64,
    transferred: u64,
    interval: Duration,
    last_report: Instant,
    last_transferred: u64,
    callback: Option<ProgressCallback>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, total: u64, interval: Duration) -> Self {
        Self {
            inner,
            total,
            transferred: 0,
            interval,
            last_report: Instant::now(),
            last_transferred: 0,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    fn report(&mut self) {
        let elapsed = self.last_report.elapsed();
        let delta = self.transferred - self.last_transferred;
        let bytes_per_sec = if elapsed.is_zero() {
            0.0
        } else {
            delta as f64 / elapsed.as_secs_f64()
        };
        let percentage = if self.total == 0 {
            100.0
        } else {
            (self.transferred as f64 / self.total as f64) * 100.0
        };
        let progress = TransferProgress {
            transferred: self.transferred,
            total: self.total,
            percentage,
            bytes_per_sec,
        };

        info!(
            percentage = %format!("{percentage:.1}"),
            transferred_mb = %format!("{:.3}", self.transferred as f64 / BYTES_PER_MEGABYTE),
            rate_mbps = %format!("{:.3}", bytes_per_sec / BYTES_PER_MEGABYTE),
            "Transfer Progress"
        );
        if let Some(callback) = &self.callback {
            callback(progress);
        }

        self.last_report = Instant::now();
        self.last_transferred = self.transferred;
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.transferred += n as u64;
        if n > 0 && self.last_report.elapsed() >= self.interval {
            self.report();
        }
        Ok(n)
    }
}
