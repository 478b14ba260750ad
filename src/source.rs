//! The remote open-data portal as seen by the pipeline.
//!
//! [`RemoteSource`] is the only network seam: discovery, detection and import
//! all go through it, so tests can swap in an in-memory source.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Fingerprint, RemoteMetadata};
use crate::retry::ErrorClass;

/// Failure talking to the remote source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The source says the resource does not exist (404/410).
    pub fn is_missing(&self) -> bool {
        matches!(self.status(), Some(404 | 410))
    }

    /// Classify for the retry scheduler.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Status {
                status: 429,
                retry_after,
                ..
            } => ErrorClass::RateLimited(*retry_after),
            Self::Status {
                status: 503,
                retry_after: Some(wait),
                ..
            } => ErrorClass::RateLimited(Some(*wait)),
            Self::Status { status, .. } if *status == 408 || *status >= 500 => {
                ErrorClass::Transient
            }
            Self::Status { .. } | Self::InvalidUrl(_) => ErrorClass::Permanent,
            Self::Network { .. } | Self::Timeout { .. } => ErrorClass::Transient,
        }
    }
}

/// A fully downloaded resource body.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub metadata: RemoteMetadata,
}

impl FetchedContent {
    pub fn content_hash(&self) -> String {
        Fingerprint::compute_hash(&self.bytes)
    }
}

/// Operations the pipeline needs from the remote portal.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch a seed listing as text.
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError>;

    /// Metadata-only request. `known` supplies validators for a conditional
    /// request; a 304 answer is reported with `known`'s values filled in.
    async fn probe(
        &self,
        url: &str,
        known: Option<&Fingerprint>,
    ) -> Result<RemoteMetadata, FetchError>;

    /// Download the full body.
    async fn fetch_content(&self, url: &str) -> Result<FetchedContent, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, retry_after: Option<Duration>) -> FetchError {
        FetchError::Status {
            url: "https://dati.example.org/a.xml".into(),
            status: code,
            retry_after,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(status(404, None).classify(), ErrorClass::Permanent);
        assert_eq!(status(500, None).classify(), ErrorClass::Transient);
        assert_eq!(status(503, None).classify(), ErrorClass::Transient);
        assert_eq!(
            status(429, Some(Duration::from_secs(3))).classify(),
            ErrorClass::RateLimited(Some(Duration::from_secs(3)))
        );
        assert_eq!(
            FetchError::Timeout { url: "x".into() }.classify(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_is_missing() {
        assert!(status(404, None).is_missing());
        assert!(status(410, None).is_missing());
        assert!(!status(403, None).is_missing());
    }
}
