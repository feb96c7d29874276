//! # db-exporter
//!
//! Runs one export of a source database to the configured SFTP endpoint, or scaffolds a
//! workspace for it.
//!
//! Exit codes: `0` success, `1` configuration failure, `2` run failure, `3` init failure.

use clap::{Parser, Subcommand};
use exporter_core::config::ConfigManager;
use exporter_core::initializer::{initialize_workspace, keygen_hint};
use exporter_core::logging::init_structured_logging;
use exporter_core::orchestration::ExportPipeline;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const EXIT_CONFIGURATION: u8 = 1;
const EXIT_RUN: u8 = 2;
const EXIT_INIT: u8 = 3;

#[derive(Parser)]
#[command(name = "db-exporter")]
#[command(about = "Export a source database and deliver it over SFTP")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one export (default)
    Run {
        /// Configuration file (default: config/exporter.toml when present)
        #[arg(short, long, env = "EXPORTER_CONFIG")]
        config: Option<PathBuf>,

        /// Override a configuration key, e.g. --set source.host=db.internal
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Create the workspace directories and a configuration template
    Init {
        /// Workspace root
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: None,
        overrides: Vec::new(),
    }) {
        Commands::Run { config, overrides } => run(config, overrides).await,
        Commands::Init { root } => init(root),
    }
}

async fn run(config: Option<PathBuf>, overrides: Vec<String>) -> ExitCode {
    let manager = match ConfigManager::load(config.as_deref(), &overrides) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("❌ Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    // held until exit so buffered file output is flushed
    let _guard = match init_structured_logging(&manager.config().logger) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ Logging setup failed: {e}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    if let Some(file) = manager.config_file() {
        info!(config_file = %file.display(), "Using configuration file");
    }

    let pipeline = ExportPipeline::new(manager.config().clone());
    match pipeline.execute().await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                rows = summary.rows(),
                remote_path = %summary.remote_path,
                "Export delivered"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, error_kind = e.kind(), "Export failed");
            ExitCode::from(EXIT_RUN)
        }
    }
}

fn init(root: PathBuf) -> ExitCode {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();

    match initialize_workspace(&root) {
        Ok(report) => {
            for path in &report.created {
                println!("✅ created {}", path.display());
            }
            for path in &report.skipped {
                println!("⏭️  exists  {}", path.display());
            }
            println!();
            println!("Generate the SFTP key pair with:");
            println!("  {}", keygen_hint(&root));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Initialization failed: {e:#}");
            ExitCode::from(EXIT_INIT)
        }
    }
}
