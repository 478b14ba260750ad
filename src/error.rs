//! Pipeline-level error type.

use std::time::Duration;

use thiserror::Error;

use crate::repository::RepositoryError;
use crate::retry::RetryError;
use crate::source::FetchError;

/// Errors surfaced by the pipeline.
///
/// Only [`SyncError::Repository`] aborts a run. Everything else is recorded
/// against the resource it concerns and the run carries on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("HTTP {status} fetching {url}")]
    PermanentFetch { url: String, status: u16 },

    #[error("rate limited by {url}")]
    RateLimit {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("could not classify {url}: {reason}")]
    Classification { url: String, reason: String },

    #[error("processing failed: {message}")]
    Processing { message: String, permanent: bool },

    #[error("lease on import {import_id} expired")]
    LeaseExpired { import_id: i64 },

    #[error("circuit open for {host}")]
    CircuitOpen { host: String },

    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether retrying could ever help.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::PermanentFetch { .. } | Self::Classification { .. } => true,
            Self::Processing { permanent, .. } => *permanent,
            _ => false,
        }
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Repository(_) | Self::Config(_))
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status {
                url,
                status,
                retry_after,
            } => match status {
                429 => Self::RateLimit { url, retry_after },
                408 | 500..=599 => {
                    Self::TransientNetwork(format!("HTTP {} fetching {}", status, url))
                }
                _ => Self::PermanentFetch { url, status },
            },
            FetchError::InvalidUrl(url) => Self::PermanentFetch { url, status: 0 },
            other => Self::TransientNetwork(other.to_string()),
        }
    }
}

impl From<RetryError<FetchError>> for SyncError {
    fn from(err: RetryError<FetchError>) -> Self {
        match err {
            RetryError::Fatal(e) => e.into(),
            RetryError::Exhausted { last, .. } => last.into(),
            RetryError::CircuitOpen { host } => Self::CircuitOpen { host },
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_map_to_sync_errors() {
        let missing: SyncError = FetchError::Status {
            url: "https://x/a.xml".into(),
            status: 404,
            retry_after: None,
        }
        .into();
        assert!(missing.is_permanent());

        let busy: SyncError = FetchError::Status {
            url: "https://x/a.xml".into(),
            status: 503,
            retry_after: None,
        }
        .into();
        assert!(!busy.is_permanent());
        assert!(!busy.is_fatal());

        let open: SyncError = RetryError::<FetchError>::CircuitOpen {
            host: "x".into(),
        }
        .into();
        assert!(matches!(open, SyncError::CircuitOpen { .. }));
    }
}
