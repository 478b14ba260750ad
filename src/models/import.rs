//! Import tracking models: one row per processing lineage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of an import lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// Content identical to an already imported version.
    Skipped,
}

impl ImportState {
    pub const ALL: [ImportState; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
        Self::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Still waiting for, or undergoing, processing.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One processing lineage for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    pub id: i64,
    pub resource_url: String,
    /// Digest of the content actually processed; unknown until downloaded.
    pub content_hash: Option<String>,
    pub state: ImportState,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processing_duration_ms: Option<u64>,
    /// Failure will not be retried automatically.
    pub permanent: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Time-bounded exclusive claim held by a worker on one import lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub import_id: i64,
    pub resource_url: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    /// Failures recorded on the lineage before this attempt.
    pub retry_count: u32,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
