//! # Resilience Module
//!
//! Fault tolerance for the one step that is expected to fail transiently: reaching a source
//! database that may still be starting.
//!
//! - [`classifier`] decides whether a driver error is a refused connection
//! - [`connection_retry`] probes a handle until it answers or the attempts run out
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exporter_core::resilience::ConnectionRetryPolicy;
//! use exporter_core::database::SourceDatabase;
//! use std::time::Duration;
//!
//! # async fn example(db: &dyn SourceDatabase) -> exporter_core::Result<()> {
//! let policy = ConnectionRetryPolicy::new(10, Duration::from_secs(1));
//! let outcome = policy.wait_for_connection(db).await?;
//! println!("connected after {} attempt(s)", outcome.attempts);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod connection_retry;

pub use classifier::{classify_connection_error, is_refusal, ConnectionErrorClass};
pub use connection_retry::{ConnectionRetryPolicy, RetryOutcome};
