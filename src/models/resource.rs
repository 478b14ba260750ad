//! Remote resources and their fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tag used for every classification field the rules could not determine.
pub const UNCLASSIFIED: &str = "unclassified";

/// Whether a resource is still published at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Active,
    /// No longer listed by a seed that was fully crawled, or the source answered 404/410.
    Inactive,
    /// The last metadata probe failed.
    Error,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Which fingerprint component decided the last change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMethod {
    Etag,
    Hash,
    Size,
    Date,
}

impl ChangeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etag => "etag",
            Self::Hash => "hash",
            Self::Size => "size",
            Self::Date => "date",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "etag" => Some(Self::Etag),
            "hash" => Some(Self::Hash),
            "size" => Some(Self::Size),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}

/// Content signature used to decide whether a resource changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    pub size: Option<u64>,
}

impl Fingerprint {
    /// SHA-256 of the payload, hex encoded.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Build a fingerprint from probe metadata (no content hash).
    pub fn from_metadata(meta: &RemoteMetadata) -> Self {
        Self {
            etag: meta.etag.clone(),
            last_modified: meta.last_modified.clone(),
            content_hash: None,
            size: meta.content_length,
        }
    }
}

/// How a resource is filed in the legislature's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Portal section, e.g. "deputati", "sedute", "votazioni".
    pub section_name: String,
    /// Kind of record, e.g. "member", "session", "vote".
    pub data_type: String,
    /// Legislature term the resource belongs to, e.g. "leg19".
    pub legislature_tag: String,
    pub content_type: String,
}

impl Classification {
    pub fn unclassified(content_type: impl Into<String>) -> Self {
        Self {
            section_name: UNCLASSIFIED.to_string(),
            data_type: UNCLASSIFIED.to_string(),
            legislature_tag: UNCLASSIFIED.to_string(),
            content_type: content_type.into(),
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.section_name == UNCLASSIFIED && self.data_type == UNCLASSIFIED
    }
}

/// Headers returned by a metadata-only request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Result of the existence check issued for a candidate during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(RemoteMetadata),
    /// The source answered 404 or 410.
    Missing { status: u16 },
    /// The probe could not be completed (transient failure, open circuit).
    Failed { error: String },
}

/// Outcome of comparing a candidate against the fingerprint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    New,
    Unchanged,
    Changed,
    Gone,
}

impl ChangeDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
            Self::Gone => "gone",
        }
    }

    /// Whether the resource must be (re)imported.
    pub fn needs_import(&self) -> bool {
        matches!(self, Self::New | Self::Changed)
    }
}

/// Decision plus the remote fingerprint observed while deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub decision: ChangeDecision,
    pub fingerprint: Fingerprint,
    pub method: Option<ChangeMethod>,
    /// `fingerprint.content_hash` comes from a download made during detection.
    pub hash_verified: bool,
}

/// A resource location emitted by discovery.
#[derive(Debug, Clone)]
pub struct CandidateResource {
    /// Normalized URL, the resource identity.
    pub url: String,
    /// Seed listing the candidate was extracted from.
    pub seed_url: String,
    pub classification: Classification,
    pub probe: ProbeOutcome,
}

impl CandidateResource {
    pub fn metadata(&self) -> Option<&RemoteMetadata> {
        match &self.probe {
            ProbeOutcome::Found(meta) => Some(meta),
            _ => None,
        }
    }
}

/// Persisted state for one remote location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub url: String,
    pub seed_url: String,
    pub section_name: String,
    pub data_type: String,
    pub legislature_tag: String,
    pub content_type: String,
    pub first_discovered_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub discovery_status: DiscoveryStatus,
    pub current_etag: Option<String>,
    pub current_last_modified: Option<String>,
    pub current_content_hash: Option<String>,
    pub current_size: Option<u64>,
    pub changed_since_last_import: bool,
    pub last_change_at: Option<DateTime<Utc>>,
    pub change_detection_method: Option<ChangeMethod>,
    /// When the stored content hash was last compared against a download.
    pub hash_verified_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub linked_import_status_id: Option<i64>,
}

impl ResourceRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            etag: self.current_etag.clone(),
            last_modified: self.current_last_modified.clone(),
            content_hash: self.current_content_hash.clone(),
            size: self.current_size,
        }
    }

    /// The stored hash is only proof of content once it was compared against a download.
    pub fn trusted_hash(&self) -> Option<&str> {
        self.hash_verified_at
            .and(self.current_content_hash.as_deref())
    }

    pub fn is_active(&self) -> bool {
        self.discovery_status == DiscoveryStatus::Active
    }
}

/// Parse an HTTP-date (RFC 7231 IMF-fixdate, which chrono reads as RFC 2822).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
