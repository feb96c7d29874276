//! # Connection Error Classification
//!
//! Decides whether a connectivity failure is transient. The only transient case is a
//! connection the remote endpoint actively refused, which is what a database container
//! that is still starting looks like from the outside. Everything else (bad credentials,
//! unknown host, TLS failures) will not fix itself by waiting.

use std::error::Error as StdError;
use std::io;

/// Classification of a database driver error from the connection's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorClass {
    /// Endpoint actively refused the connection; retry after an interval
    Refused,
    /// Connectivity failure that retrying will not fix
    Fatal,
    /// Not a connectivity failure at all (query or data error)
    NotConnection,
}

/// SQLSTATE classes that are raised while establishing a session:
/// `08` connection exception, `28` invalid authorization, `3D` invalid catalog name.
const CONNECT_PHASE_SQLSTATE_CLASSES: [&str; 3] = ["08", "28", "3D"];

pub fn classify_connection_error(err: &sqlx::Error) -> ConnectionErrorClass {
    if is_refusal(err) {
        return ConnectionErrorClass::Refused;
    }

    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ConnectionErrorClass::Fatal,
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code)
                if CONNECT_PHASE_SQLSTATE_CLASSES
                    .iter()
                    .any(|class| code.starts_with(class)) =>
            {
                ConnectionErrorClass::Fatal
            }
            _ => ConnectionErrorClass::NotConnection,
        },
        _ => ConnectionErrorClass::NotConnection,
    }
}

/// Walk the source chain looking for an `io::Error` of kind `ConnectionRefused`.
pub fn is_refusal(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}
