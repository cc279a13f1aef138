//! Error taxonomy for the detection core
//!
//! Content errors (bad audio, short windows) are absorbed by the worker
//! loop so one bad window never halts a station; stream and database
//! errors bubble to the supervisor, which decides on backoff or restart.

use thiserror::Error;

/// Result type for detection-core operations
pub type DetectResult<T> = std::result::Result<T, DetectError>;

/// Detection-core error kinds
#[derive(Debug, Error)]
pub enum DetectError {
    /// Buffer is empty, DC-only, or produced NaNs during analysis
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    /// Fewer samples than the analyzer minimum remained after decoding
    #[error("Audio too short: {samples} samples")]
    TooShort { samples: usize },

    /// Endpoint unreachable, non-2xx, or not an audio stream
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Connection lost mid-stream
    #[error("Stream dropped: {0}")]
    StreamDropped(String),

    /// Provider failure worth retrying (network, 5xx, rate limit)
    #[error("Provider {provider} transient failure: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Provider failure that will not heal (bad key, malformed response)
    #[error("Provider {provider} permanent failure: {message}")]
    ProviderPermanent { provider: String, message: String },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared-crate error
    #[error(transparent)]
    Common(#[from] sodav_common::Error),

    /// Shutdown or deadline hit; silent unwind, not a failure
    #[error("Cancelled")]
    Cancelled,
}

impl DetectError {
    /// Errors the worker absorbs by skipping the current window.
    pub fn is_window_recoverable(&self) -> bool {
        matches!(
            self,
            DetectError::InvalidAudio(_) | DetectError::TooShort { .. }
        )
    }

    /// Errors that put the station into degraded mode with backoff.
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            DetectError::StreamUnavailable(_) | DetectError::StreamDropped(_)
        )
    }

    /// True when the underlying cause is a unique-constraint conflict
    /// (a concurrent resolver won an ISRC or fingerprint race).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DetectError::Database(sqlx::Error::Database(db_err)) => {
                db_err.message().contains("UNIQUE constraint failed")
            }
            DetectError::Common(err) => err.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_recoverable_classification() {
        assert!(DetectError::InvalidAudio("nan".into()).is_window_recoverable());
        assert!(DetectError::TooShort { samples: 12 }.is_window_recoverable());
        assert!(!DetectError::StreamDropped("eof".into()).is_window_recoverable());
        assert!(!DetectError::Cancelled.is_window_recoverable());
    }

    #[test]
    fn test_stream_failure_classification() {
        assert!(DetectError::StreamUnavailable("404".into()).is_stream_failure());
        assert!(DetectError::StreamDropped("reset".into()).is_stream_failure());
        assert!(!DetectError::InvalidAudio("dc".into()).is_stream_failure());
    }
}
