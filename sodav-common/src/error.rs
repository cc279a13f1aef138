//! Shared error type for the monitor crates
//!
//! Covers the concerns sodav-common itself owns: configuration loading,
//! the SQLite store, and ISRC parsing. The detection core wraps this in
//! its own `DetectError` taxonomy for pipeline-specific failures.

use thiserror::Error;

/// Shared result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared infrastructure
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected by the ISRC validator; the offending raw code is kept
    /// for the log line
    #[error("invalid ISRC {0:?}")]
    InvalidIsrc(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// True when the underlying cause is a SQLite unique-constraint violation.
    ///
    /// The identity resolver uses this to detect a lost ISRC/fingerprint
    /// insert race and re-run its lookup path.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => {
                db_err.message().contains("UNIQUE constraint failed")
            }
            _ => false,
        }
    }
}
