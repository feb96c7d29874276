//! # Export Pipeline
//!
//! Assembles the production task graph for one run, executes it, and always finalizes.
//!
//! ```text
//! recover_orphans -> connect -> wait_for_connection -> create_export_dir -> chmod_export_dir
//!   -> load_preprocessor -> run_preprocessor -> load_mapping -> build_export_tasks
//!   -> run_exports -> write_mapping -> compress -> read_private_key -> transfer
//! ```
//!
//! Finalization closes the connection, deletes the export directory, then deletes the archive,
//! each only if the run acquired it. The error returned is the first of: the run failure, the
//! directory deletion failure, the archive deletion failure. A connection close failure is
//! logged only.

use chrono::Local;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunConfiguration;
use crate::constants::artifacts::{MAPPING_FILE, RUN_MARKER_FILE};
use crate::constants::steps::*;
use crate::constants::system::{BYTES_PER_MEGABYTE, EXPORT_RUNNER, PREPROCESS_RUNNER};
use crate::constants::RunPhase;
use crate::database::{ConnectionGateway, DialectGateway, SourceDatabase};
use crate::error::{ExporterError, Result};
use crate::mapping::{Mapping, MappingDirectory, MappingSource};
use crate::orchestration::orphan_recovery::{OrphanRecovery, RecoveryReport, RunMarker};
use crate::orchestration::parallel_runner::{BoundedParallelRunner, RunnerReport};
use crate::orchestration::run_layout::{export_file_in, RunDirectoryPattern, RunLayout};
use crate::orchestration::run_state::RunState;
use crate::orchestration::task_graph::{StepInputs, TaskGraph};
use crate::orchestration::types::{ArchiveInfo, ExportTask, RunSummary, TaskMetrics};
use crate::resilience::ConnectionRetryPolicy;
use crate::transfer::{
    compress_directory, PrivateKey, RemoteTransport, SftpTransport, TransferReport,
    TransferRequest,
};

/// Result of one pipeline step
#[derive(Debug, Clone)]
pub enum StepOutput {
    Done,
    Recovery(RecoveryReport),
    Connection(Arc<dyn SourceDatabase>),
    /// Absolute path of the export directory
    Directory(PathBuf),
    Statements(Vec<String>),
    Mapping(Arc<Mapping>),
    Tasks(Vec<ExportTask>),
    Preprocessed(TaskMetrics),
    Exported(RunnerReport),
    Archive(ArchiveInfo),
    Credential(Arc<PrivateKey>),
    Transfer(TransferReport),
}

fn unexpected(step: &str, output: &StepOutput) -> ExporterError {
    ExporterError::Graph(format!("step '{step}' produced an unexpected result: {output:?}"))
}

fn connection_from(inputs: &StepInputs<StepOutput>) -> Result<Arc<dyn SourceDatabase>> {
    match inputs.get(CONNECT)? {
        StepOutput::Connection(db) => Ok(db.clone()),
        other => Err(unexpected(CONNECT, other)),
    }
}

fn directory_from(inputs: &StepInputs<StepOutput>) -> Result<PathBuf> {
    match inputs.get(CREATE_EXPORT_DIR)? {
        StepOutput::Directory(path) => Ok(path.clone()),
        other => Err(unexpected(CREATE_EXPORT_DIR, other)),
    }
}

fn statements_from(inputs: &StepInputs<StepOutput>) -> Result<Vec<String>> {
    match inputs.get(LOAD_PREPROCESSOR)? {
        StepOutput::Statements(statements) => Ok(statements.clone()),
        other => Err(unexpected(LOAD_PREPROCESSOR, other)),
    }
}

fn mapping_from(inputs: &StepInputs<StepOutput>) -> Result<Arc<Mapping>> {
    match inputs.get(LOAD_MAPPING)? {
        StepOutput::Mapping(mapping) => Ok(mapping.clone()),
        other => Err(unexpected(LOAD_MAPPING, other)),
    }
}

fn tasks_from(inputs: &StepInputs<StepOutput>) -> Result<Vec<ExportTask>> {
    match inputs.get(BUILD_EXPORT_TASKS)? {
        StepOutput::Tasks(tasks) => Ok(tasks.clone()),
        other => Err(unexpected(BUILD_EXPORT_TASKS, other)),
    }
}

fn archive_from(inputs: &StepInputs<StepOutput>) -> Result<ArchiveInfo> {
    match inputs.get(COMPRESS)? {
        StepOutput::Archive(info) => Ok(info.clone()),
        other => Err(unexpected(COMPRESS, other)),
    }
}

fn credential_from(inputs: &StepInputs<StepOutput>) -> Result<Arc<PrivateKey>> {
    match inputs.get(READ_PRIVATE_KEY)? {
        StepOutput::Credential(key) => Ok(key.clone()),
        other => Err(unexpected(READ_PRIVATE_KEY, other)),
    }
}

/// Shared, read-only context handed to every step
#[derive(Debug)]
struct RunContext {
    run_id: Uuid,
    config: Arc<RunConfiguration>,
    layout: RunLayout,
    pattern: RunDirectoryPattern,
    state: Arc<RunState>,
    gateway: Arc<dyn ConnectionGateway>,
    transport: Arc<dyn RemoteTransport>,
    mappings: Arc<dyn MappingSource>,
}

/// Entry point of an export run
#[derive(Debug, Clone)]
pub struct ExportPipeline {
    config: Arc<RunConfiguration>,
    gateway: Arc<dyn ConnectionGateway>,
    transport: Arc<dyn RemoteTransport>,
    mappings: Arc<dyn MappingSource>,
}

impl ExportPipeline {
    /// Production collaborators: dialect gateway, SFTP transport, mapping directory.
    pub fn new(config: RunConfiguration) -> Self {
        let mappings = MappingDirectory::new(config.mapping_dir.clone());
        Self {
            config: Arc::new(config),
            gateway: Arc::new(DialectGateway),
            transport: Arc::new(SftpTransport::new()),
            mappings: Arc::new(mappings),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ConnectionGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_mapping_source(mut self, mappings: Arc<dyn MappingSource>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Run once. Local artifacts are gone when this returns, whatever the outcome.
    pub async fn execute(&self) -> Result<RunSummary> {
        self.execute_with_state(Arc::new(RunState::new())).await
    }

    /// [`execute`](Self::execute) with caller-provided state, for inspecting phases afterwards.
    pub async fn execute_with_state(&self, state: Arc<RunState>) -> Result<RunSummary> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();

        let pattern = match self.preflight().await {
            Ok(pattern) => pattern,
            Err(e) => {
                state.advance(RunPhase::Failed);
                error!(
                    run_id = %run_id,
                    mapping = %self.config.mapping,
                    error = %e,
                    error_kind = e.kind(),
                    "Export Run Failure"
                );
                return Err(e);
            }
        };

        let layout = RunLayout::new(&self.config, pattern.render(&Local::now()));
        info!(
            run_id = %run_id,
            mapping = %self.config.mapping,
            export_dir = %layout.export_dir.display(),
            archive = %layout.archive_path.display(),
            remote_path = %layout.remote_path,
            "Export Run Started"
        );
        debug!(config = %self.config.sanitized(), "Run configuration");

        let context = Arc::new(RunContext {
            run_id,
            config: self.config.clone(),
            layout,
            pattern,
            state: state.clone(),
            gateway: self.gateway.clone(),
            transport: self.transport.clone(),
            mappings: self.mappings.clone(),
        });

        let run_result = match Self::build_graph(context.clone()) {
            Ok(graph) => {
                let outcome = graph.with_observer(state.clone()).execute().await;
                if let Some((step, err)) = &outcome.error {
                    warn!(
                        step = %step,
                        error = %err,
                        skipped = ?outcome.skipped,
                        "Export run stopped at first failure"
                    );
                }
                outcome.into_result()
            }
            Err(e) => Err(e),
        };

        let final_result = finalize(&state, run_result).await;
        let elapsed = start.elapsed();

        match final_result {
            Ok(results) => {
                let summary = summarize(&context, &results, elapsed)?;
                state.advance(RunPhase::Succeeded);
                info!(
                    run_id = %run_id,
                    rows = summary.totals.rows,
                    size_mb = %format!("{:.3}", summary.totals.bytes as f64 / BYTES_PER_MEGABYTE),
                    serial_sec = summary.totals.elapsed_ms as f64 / 1000.0,
                    archive_bytes = summary.archive_bytes,
                    elapsed_sec = elapsed.as_secs_f64(),
                    "Export Run Success"
                );
                Ok(summary)
            }
            Err(err) => {
                state.advance(RunPhase::Failed);
                error!(
                    run_id = %run_id,
                    error = %err,
                    error_kind = err.kind(),
                    elapsed_sec = elapsed.as_secs_f64(),
                    "Export Run Failure"
                );
                Err(err)
            }
        }
    }

    /// Checks that need no resources: the directory pattern and the mapping's presence.
    async fn preflight(&self) -> Result<RunDirectoryPattern> {
        let pattern = RunDirectoryPattern::compile(&self.config.date_format)?;
        self.mappings.check_mapping(&self.config.mapping).await?;
        Ok(pattern)
    }

    fn build_graph(ctx: Arc<RunContext>) -> Result<TaskGraph<StepOutput>> {
        let c = || ctx.clone();

        TaskGraph::builder()
            .step(RECOVER_ORPHANS, &[], {
                let ctx = c();
                move |_| async move { recover_orphans(&ctx).await }
            })
            .step(CONNECT, &[RECOVER_ORPHANS], {
                let ctx = c();
                move |_| async move {
                    let db = ctx.gateway.connect(&ctx.config.source).await?;
                    ctx.state.record_connection(db.clone());
                    Ok(StepOutput::Connection(db))
                }
            })
            .step(WAIT_FOR_CONNECTION, &[CONNECT], {
                let ctx = c();
                move |inputs| async move {
                    let db = connection_from(&inputs)?;
                    ConnectionRetryPolicy::from_config(&ctx.config)
                        .wait_for_connection(db.as_ref())
                        .await?;
                    Ok(StepOutput::Done)
                }
            })
            .step(CREATE_EXPORT_DIR, &[WAIT_FOR_CONNECTION], {
                let ctx = c();
                move |_| async move { create_export_dir(&ctx).await }
            })
            .step(CHMOD_EXPORT_DIR, &[CREATE_EXPORT_DIR], {
                let ctx = c();
                move |inputs| async move {
                    let dir = directory_from(&inputs)?;
                    chmod_export_dir(&ctx.config, &dir).await?;
                    Ok(StepOutput::Done)
                }
            })
            .step(LOAD_PREPROCESSOR, &[CHMOD_EXPORT_DIR], {
                let ctx = c();
                move |_| async move {
                    let statements = ctx.mappings.load_preprocessor(&ctx.config.mapping).await?;
                    info!(statements = statements.len(), "Preprocessor loaded");
                    Ok(StepOutput::Statements(statements))
                }
            })
            .step(RUN_PREPROCESSOR, &[LOAD_PREPROCESSOR], move |inputs| async move {
                let db = connection_from(&inputs)?;
                let statements = statements_from(&inputs)?;
                let report = BoundedParallelRunner::serial(PREPROCESS_RUNNER)
                    .run(statements, |statement| {
                        let db = db.clone();
                        async move {
                            let start = Instant::now();
                            debug!(statement = %statement, "Preprocess Statement Started");
                            let output = db.query(&statement, &[]).await?;
                            Ok(TaskMetrics::new(
                                output.rows_affected,
                                0,
                                start.elapsed().as_millis() as u64,
                            ))
                        }
                    })
                    .await?;
                Ok(StepOutput::Preprocessed(report.metrics))
            })
            .step(LOAD_MAPPING, &[RUN_PREPROCESSOR], {
                let ctx = c();
                move |_| async move {
                    let mapping = ctx.mappings.load_mapping(&ctx.config.mapping).await?;
                    info!(mapping = %mapping.name, entries = mapping.len(), "Mapping loaded");
                    Ok(StepOutput::Mapping(Arc::new(mapping)))
                }
            })
            .step(BUILD_EXPORT_TASKS, &[LOAD_MAPPING], move |inputs| async move {
                let mapping = mapping_from(&inputs)?;
                let dir = directory_from(&inputs)?;
                Ok(StepOutput::Tasks(build_export_tasks(&mapping, &dir)))
            })
            .step(RUN_EXPORTS, &[BUILD_EXPORT_TASKS], {
                let ctx = c();
                move |inputs| async move {
                    let db = connection_from(&inputs)?;
                    let tasks = tasks_from(&inputs)?;
                    let report = BoundedParallelRunner::new(EXPORT_RUNNER, ctx.config.parallel_extracts)
                        .run(tasks, |task| export_one(db.clone(), task))
                        .await?;
                    Ok(StepOutput::Exported(report))
                }
            })
            .step(WRITE_MAPPING, &[RUN_EXPORTS], move |inputs| async move {
                let mapping = mapping_from(&inputs)?;
                let path = directory_from(&inputs)?.join(MAPPING_FILE);
                tokio::fs::write(&path, mapping.raw.as_bytes())
                    .await
                    .map_err(|e| ExporterError::filesystem("write mapping", &path, e))?;
                Ok(StepOutput::Done)
            })
            .step(COMPRESS, &[WRITE_MAPPING], {
                let ctx = c();
                move |inputs| async move {
                    let dir = directory_from(&inputs)?;
                    let archive = ctx.layout.archive_path.clone();
                    ctx.state.record_archive(archive.clone());
                    let info = compress_directory(
                        &dir,
                        &archive,
                        ctx.config.compress_format,
                        &[RUN_MARKER_FILE],
                    )
                    .await?;
                    info!(
                        archive = %info.path.display(),
                        entries = info.entries,
                        size_mb = %format!("{:.3}", info.size_bytes as f64 / BYTES_PER_MEGABYTE),
                        "Archive created"
                    );
                    Ok(StepOutput::Archive(info))
                }
            })
            .step(READ_PRIVATE_KEY, &[COMPRESS], {
                let ctx = c();
                move |_| async move {
                    let key = PrivateKey::read(&ctx.config.target.private_key).await?;
                    Ok(StepOutput::Credential(Arc::new(key)))
                }
            })
            .step(TRANSFER, &[READ_PRIVATE_KEY], {
                let ctx = c();
                move |inputs| async move {
                    let archive = archive_from(&inputs)?;
                    let key = credential_from(&inputs)?;
                    let target = &ctx.config.target;
                    let request = TransferRequest {
                        local_path: archive.path.clone(),
                        size_bytes: archive.size_bytes,
                        host: target.host.clone(),
                        port: target.port,
                        username: target.username.clone(),
                        remote_path: ctx.layout.remote_path.clone(),
                        private_key: key,
                    };
                    info!(
                        host = %request.host,
                        remote_path = %request.remote_path,
                        size_bytes = request.size_bytes,
                        "Delivering archive"
                    );
                    let report = ctx.transport.transfer(request).await?;
                    Ok(StepOutput::Transfer(report))
                }
            })
            .build()
    }
}

async fn recover_orphans(ctx: &RunContext) -> Result<StepOutput> {
    let recovery = OrphanRecovery::new(ctx.config.working_dir.clone(), ctx.pattern.clone());
    let report = recovery.run().await;
    info!(
        scanned = report.scanned,
        deleted = report.deleted.len(),
        preserved = report.preserved.len(),
        failures = report.failures.len(),
        "Orphan check complete"
    );
    if let Err(err) = report.clone().into_result() {
        // reported, never fatal to the run
        warn!(error = %err, "Orphan Check Failure");
    }
    Ok(StepOutput::Recovery(report))
}

async fn create_export_dir(ctx: &RunContext) -> Result<StepOutput> {
    let working_dir = &ctx.config.working_dir;
    let export_dir = &ctx.layout.export_dir;

    tokio::fs::create_dir_all(working_dir)
        .await
        .map_err(|e| ExporterError::filesystem("create working directory", working_dir, e))?;
    tokio::fs::create_dir(export_dir)
        .await
        .map_err(|e| ExporterError::filesystem("create export directory", export_dir, e))?;
    ctx.state.record_export_dir(export_dir.clone());

    RunMarker::new(ctx.run_id, ctx.config.mapping.clone())
        .write(export_dir)
        .await?;

    // exports are written by the database server, which needs an absolute path
    let absolute = tokio::fs::canonicalize(export_dir)
        .await
        .map_err(|e| ExporterError::filesystem("resolve export directory", export_dir, e))?;
    Ok(StepOutput::Directory(absolute))
}

async fn chmod_export_dir(config: &RunConfiguration, dir: &Path) -> Result<()> {
    let mode = config.directory_mode().ok_or_else(|| {
        ExporterError::Configuration(format!(
            "invalid working_dir_mode '{}'",
            config.working_dir_mode
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| ExporterError::filesystem("chmod export directory", dir, e))?;
    }
    #[cfg(not(unix))]
    debug!(path = %dir.display(), mode = mode, "Directory modes are not applied on this platform");

    Ok(())
}

fn build_export_tasks(mapping: &Mapping, dir: &Path) -> Vec<ExportTask> {
    mapping
        .entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let destination = export_file_in(dir, &entry.target, index);
            debug!(table = %entry.target, filepath = %destination.display(), "Task Created");
            ExportTask {
                index,
                target: entry.target.clone(),
                query: entry.query.clone(),
                destination,
            }
        })
        .collect()
}

async fn export_one(db: Arc<dyn SourceDatabase>, task: ExportTask) -> Result<TaskMetrics> {
    let start = Instant::now();
    debug!(table = %task.target, index = task.index, "Export Query Started");

    let output = db.export_data(&task.query, &task.destination).await?;
    let bytes = tokio::fs::metadata(&task.destination)
        .await
        .map_err(|e| ExporterError::filesystem("stat export file", &task.destination, e))?
        .len();
    let elapsed = start.elapsed();

    info!(
        table = %task.target,
        basename = %task.destination.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        rows = output.rows_written,
        size_mb = %format!("{:.3}", bytes as f64 / BYTES_PER_MEGABYTE),
        elapsed_sec = elapsed.as_secs_f64(),
        "Export Query Success"
    );
    Ok(TaskMetrics::new(
        output.rows_written,
        bytes,
        elapsed.as_millis() as u64,
    ))
}

/// Release everything the run acquired and pick the error to report.
async fn finalize(
    state: &RunState,
    run_result: Result<HashMap<String, StepOutput>>,
) -> Result<HashMap<String, StepOutput>> {
    state.advance(RunPhase::CleaningUp);
    let start = Instant::now();
    info!(run_failed = run_result.is_err(), "Cleanup Started");

    if let Some(db) = state.take_connection() {
        if let Err(e) = db.cleanup().await {
            warn!(error = %e, "Closing the database connection failed");
        }
    }

    let dir_result = match state.take_export_dir() {
        Some(dir) => remove_ignoring_missing(tokio::fs::remove_dir_all(&dir).await)
            .map_err(|e| ExporterError::filesystem("delete export directory", &dir, e)),
        None => Ok(()),
    };

    let file_result = match state.take_archive() {
        Some(archive) => remove_ignoring_missing(tokio::fs::remove_file(&archive).await)
            .map_err(|e| ExporterError::filesystem("delete archive", &archive, e)),
        None => Ok(()),
    };

    if let Err(e) = &dir_result {
        error!(error = %e, "Cleanup Failure");
    }
    if let Err(e) = &file_result {
        error!(error = %e, "Cleanup Failure");
    }
    if dir_result.is_ok() && file_result.is_ok() {
        info!(elapsed_sec = start.elapsed().as_secs_f64(), "Cleanup Success");
    }

    let results = run_result?;
    dir_result?;
    file_result?;
    Ok(results)
}

fn remove_ignoring_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn summarize(
    ctx: &RunContext,
    results: &HashMap<String, StepOutput>,
    elapsed: std::time::Duration,
) -> Result<RunSummary> {
    let missing = |step: &str| ExporterError::Graph(format!("no result for step '{step}'"));

    let orphans = match results.get(RECOVER_ORPHANS) {
        Some(StepOutput::Recovery(report)) => report.clone(),
        _ => return Err(missing(RECOVER_ORPHANS)),
    };
    let totals = match results.get(RUN_EXPORTS) {
        Some(StepOutput::Exported(report)) => report.metrics,
        _ => return Err(missing(RUN_EXPORTS)),
    };
    let archive_bytes = match results.get(COMPRESS) {
        Some(StepOutput::Archive(info)) => info.size_bytes,
        _ => return Err(missing(COMPRESS)),
    };
    let remote_path = match results.get(TRANSFER) {
        Some(StepOutput::Transfer(report)) => report.remote_path.clone(),
        _ => return Err(missing(TRANSFER)),
    };

    Ok(RunSummary {
        run_id: ctx.run_id,
        timestamp: ctx.layout.timestamp.clone(),
        export_dir: ctx.layout.export_dir.clone(),
        archive_path: ctx.layout.archive_path.clone(),
        remote_path,
        totals,
        archive_bytes,
        orphans,
        elapsed,
    })
}
