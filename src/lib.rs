#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Exporter Core
//!
//! Unattended export of a source database to a remote SFTP endpoint.
//!
//! ## Overview
//!
//! One run recovers directories orphaned by earlier crashed runs, connects to the source
//! database and waits until it answers, creates a fresh export directory, runs preprocessing
//! statements in order, exports every mapped query to CSV with bounded parallelism, writes the
//! mapping alongside, archives the directory and delivers the archive over SFTP. Whatever the
//! outcome, the connection is closed and the local directory and archive are deleted before the
//! run returns.
//!
//! ## Module Organization
//!
//! - [`config`] - Layered configuration loading and validation
//! - [`database`] - Source database abstraction with PostgreSQL and MySQL backends
//! - [`mapping`] - Mapping and preprocessor definitions
//! - [`orchestration`] - Task graph, bounded runner, orphan recovery and the export pipeline
//! - [`resilience`] - Connection retry and error classification
//! - [`transfer`] - Archive creation and SFTP delivery
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exporter_core::config::ConfigManager;
//! use exporter_core::orchestration::ExportPipeline;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load(None, &["mapping=clinic".to_string()])?;
//! let summary = ExportPipeline::new(manager.config().clone()).execute().await?;
//! println!("exported {} rows to {}", summary.rows(), summary.remote_path);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests against mocks
//! cargo test -- --ignored   # Live database tests (EXPORTER_TEST_*_URL)
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod initializer;
pub mod logging;
pub mod mapping;
pub mod orchestration;
pub mod resilience;
pub mod transfer;

pub use config::{ArchiveFormat, ConfigManager, RunConfiguration};
pub use constants::{artifacts, steps, system, RunPhase};
pub use database::{ConnectionGateway, Dialect, SourceDatabase};
pub use error::{ExporterError, Result};
pub use orchestration::{ExportPipeline, RunState, RunSummary};
