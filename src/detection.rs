//! Change detection: compare a probed candidate with its stored fingerprint.
//!
//! Checks run cheapest first: ETag, Last-Modified, size, then a download and
//! SHA-256. The digest is authoritative. When hash verification is forced the
//! header shortcuts are skipped entirely.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::SyncError;
use crate::models::{
    parse_http_date, CandidateResource, ChangeDecision, ChangeMethod, Detection, Fingerprint,
    ProbeOutcome, RemoteMetadata, ResourceRecord,
};
use crate::retry::RetryScheduler;
use crate::source::{FetchError, RemoteSource};

/// Detector settings.
#[derive(Debug, Clone, Default)]
pub struct DetectionOptions {
    /// Always download and hash; never trust headers.
    pub verify_hash: bool,
    /// Re-verify by hash when the stored hash was last verified longer ago than this.
    pub verify_after: Option<Duration>,
}

/// Decides New / Unchanged / Changed / Gone for each candidate.
pub struct ChangeDetector {
    source: Arc<dyn RemoteSource>,
    scheduler: RetryScheduler,
    options: DetectionOptions,
}

impl ChangeDetector {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        scheduler: RetryScheduler,
        options: DetectionOptions,
    ) -> Self {
        Self {
            source,
            scheduler,
            options,
        }
    }

    /// Compare `candidate` with its stored record. Nothing is persisted here.
    pub async fn detect(
        &self,
        candidate: &CandidateResource,
        existing: Option<&ResourceRecord>,
        now: DateTime<Utc>,
    ) -> Result<Detection, SyncError> {
        let meta = match &candidate.probe {
            ProbeOutcome::Found(meta) => meta,
            ProbeOutcome::Missing { .. } => {
                return Ok(Detection {
                    decision: ChangeDecision::Gone,
                    fingerprint: existing.map(|r| r.fingerprint()).unwrap_or_default(),
                    method: None,
                    hash_verified: false,
                });
            }
            ProbeOutcome::Failed { error } => {
                return Err(SyncError::TransientNetwork(error.clone()));
            }
        };

        let Some(record) = existing else {
            return Ok(Detection {
                decision: ChangeDecision::New,
                fingerprint: Fingerprint::from_metadata(meta),
                method: None,
                hash_verified: false,
            });
        };

        if !self.must_verify_hash(record, now) {
            if let Some(detection) = header_decision(meta, record) {
                debug!(
                    "{}: {} by {}",
                    candidate.url,
                    detection.decision.as_str(),
                    detection.method.map(|m| m.as_str()).unwrap_or("-")
                );
                return Ok(detection);
            }
        }

        self.hash_decision(&candidate.url, record).await
    }

    /// Detection used when change detection is bypassed.
    pub fn forced(candidate: &CandidateResource, existing: Option<&ResourceRecord>) -> Detection {
        let fingerprint = candidate
            .metadata()
            .map(Fingerprint::from_metadata)
            .unwrap_or_default();
        Detection {
            decision: if existing.is_some() {
                ChangeDecision::Changed
            } else {
                ChangeDecision::New
            },
            fingerprint,
            method: None,
            hash_verified: false,
        }
    }

    fn must_verify_hash(&self, record: &ResourceRecord, now: DateTime<Utc>) -> bool {
        if self.options.verify_hash {
            return true;
        }
        match (self.options.verify_after, record.trusted_hash()) {
            (Some(max_age), Some(_)) => record
                .hash_verified_at
                .is_none_or(|at| now - at > max_age),
            _ => false,
        }
    }

    async fn hash_decision(
        &self,
        url: &str,
        record: &ResourceRecord,
    ) -> Result<Detection, SyncError> {
        let content = self
            .scheduler
            .execute(url, || self.source.fetch_content(url), FetchError::classify)
            .await?;

        let hash = content.content_hash();
        let fingerprint = Fingerprint {
            etag: content.metadata.etag.clone(),
            last_modified: content.metadata.last_modified.clone(),
            content_hash: Some(hash.clone()),
            size: Some(content.bytes.len() as u64),
        };
        let decision = if record.current_content_hash.as_deref() == Some(hash.as_str()) {
            ChangeDecision::Unchanged
        } else {
            ChangeDecision::Changed
        };
        debug!("{}: {} by hash", url, decision.as_str());

        Ok(Detection {
            decision,
            fingerprint,
            method: Some(ChangeMethod::Hash),
            hash_verified: true,
        })
    }
}

/// Decide from response headers alone, if they are conclusive.
fn header_decision(meta: &RemoteMetadata, record: &ResourceRecord) -> Option<Detection> {
    let from_headers = |decision, method| Detection {
        decision,
        fingerprint: Fingerprint::from_metadata(meta),
        method: Some(method),
        hash_verified: false,
    };

    if let (Some(remote), Some(stored)) = (&meta.etag, &record.current_etag) {
        if remote == stored {
            return Some(from_headers(ChangeDecision::Unchanged, ChangeMethod::Etag));
        }
    }

    let remote_date = meta.last_modified.as_deref().and_then(parse_http_date);
    let stored_date = record
        .current_last_modified
        .as_deref()
        .and_then(parse_http_date);
    if let (Some(remote), Some(stored)) = (remote_date, stored_date) {
        if remote <= stored {
            return Some(from_headers(ChangeDecision::Unchanged, ChangeMethod::Date));
        }
    }

    if let (Some(remote), Some(stored)) = (meta.content_length, record.current_size) {
        if remote != stored {
            return Some(from_headers(ChangeDecision::Changed, ChangeMethod::Size));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, DiscoveryStatus};
    use crate::source::FetchedContent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Body {
        bytes: &'static [u8],
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSource for Body {
        async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
            Err(FetchError::InvalidUrl(url.into()))
        }

        async fn probe(
            &self,
            url: &str,
            _known: Option<&Fingerprint>,
        ) -> Result<RemoteMetadata, FetchError> {
            Err(FetchError::InvalidUrl(url.into()))
        }

        async fn fetch_content(&self, _url: &str) -> Result<FetchedContent, FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedContent {
                bytes: self.bytes.to_vec(),
                metadata: RemoteMetadata {
                    status: 200,
                    etag: Some("\"v1\"".into()),
                    ..Default::default()
                },
            })
        }
    }

    fn detector(body: &'static [u8], options: DetectionOptions) -> (Arc<Body>, ChangeDetector) {
        let source = Arc::new(Body {
            bytes: body,
            downloads: AtomicUsize::new(0),
        });
        let detector = ChangeDetector::new(source.clone(), RetryScheduler::default(), options);
        (source, detector)
    }

    fn candidate(meta: RemoteMetadata) -> CandidateResource {
        CandidateResource {
            url: "https://dati.example.org/votazioni.xml".into(),
            seed_url: "https://dati.example.org/".into(),
            classification: Classification::unclassified("application/xml"),
            probe: ProbeOutcome::Found(meta),
        }
    }

    fn record(etag: Option<&str>, hash: Option<&str>) -> ResourceRecord {
        let now = Utc::now();
        ResourceRecord {
            url: "https://dati.example.org/votazioni.xml".into(),
            seed_url: "https://dati.example.org/".into(),
            section_name: "votazioni".into(),
            data_type: "vote".into(),
            legislature_tag: "leg19".into(),
            content_type: "application/xml".into(),
            first_discovered_at: now,
            last_checked_at: now,
            discovery_status: DiscoveryStatus::Active,
            current_etag: etag.map(String::from),
            current_last_modified: Some("Tue, 15 Nov 1994 08:12:31 GMT".into()),
            current_content_hash: hash.map(String::from),
            current_size: Some(3),
            changed_since_last_import: false,
            last_change_at: None,
            change_detection_method: None,
            hash_verified_at: hash.map(|_| now),
            last_error: None,
            linked_import_status_id: None,
        }
    }

    fn meta(etag: Option<&str>, last_modified: Option<&str>, len: Option<u64>) -> RemoteMetadata {
        RemoteMetadata {
            status: 200,
            etag: etag.map(String::from),
            last_modified: last_modified.map(String::from),
            content_length: len,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn test_new_without_record() {
        let (source, detector) = detector(b"abc", DetectionOptions::default());
        let d = detector
            .detect(&candidate(meta(Some("\"v1\""), None, None)), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::New);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_matching_etag_is_unchanged_without_download() {
        let (source, detector) = detector(b"abc", DetectionOptions::default());
        let existing = record(Some("\"v1\""), None);
        let d = detector
            .detect(&candidate(meta(Some("\"v1\""), None, None)), Some(&existing), Utc::now())
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::Unchanged);
        assert_eq!(d.method, Some(ChangeMethod::Etag));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_older_last_modified_is_unchanged() {
        let (_source, detector) = detector(b"abc", DetectionOptions::default());
        let existing = record(None, None);
        let d = detector
            .detect(
                &candidate(meta(None, Some("Mon, 14 Nov 1994 08:12:31 GMT"), None)),
                Some(&existing),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::Unchanged);
        assert_eq!(d.method, Some(ChangeMethod::Date));
    }

    #[tokio::test]
    async fn test_size_difference_is_changed() {
        let (source, detector) = detector(b"abcd", DetectionOptions::default());
        let existing = record(Some("\"v1\""), None);
        let d = detector
            .detect(&candidate(meta(Some("\"v2\""), None, Some(4))), Some(&existing), Utc::now())
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::Changed);
        assert_eq!(d.method, Some(ChangeMethod::Size));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hash_decides_when_headers_are_inconclusive() {
        let hash = Fingerprint::compute_hash(b"abc");
        let (source, detector) = detector(b"abc", DetectionOptions::default());
        let existing = record(Some("\"v1\""), Some(&hash));
        let d = detector
            .detect(&candidate(meta(Some("\"v2\""), None, Some(3))), Some(&existing), Utc::now())
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::Unchanged);
        assert_eq!(d.method, Some(ChangeMethod::Hash));
        assert!(d.hash_verified);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_verify_hash_overrides_stale_etag() {
        // Same ETag, different body: only the digest notices.
        let old = Fingerprint::compute_hash(b"abc");
        let (_source, detector) = detector(
            b"xyz",
            DetectionOptions {
                verify_hash: true,
                verify_after: None,
            },
        );
        let existing = record(Some("\"v1\""), Some(&old));
        let d = detector
            .detect(&candidate(meta(Some("\"v1\""), None, Some(3))), Some(&existing), Utc::now())
            .await
            .unwrap();
        assert_eq!(d.decision, ChangeDecision::Changed);
        assert_eq!(d.fingerprint.content_hash, Some(Fingerprint::compute_hash(b"xyz")));
    }

    #[tokio::test]
    async fn test_stale_verification_forces_hash() {
        let hash = Fingerprint::compute_hash(b"abc");
        let (source, detector) = detector(
            b"abc",
            DetectionOptions {
                verify_hash: false,
                verify_after: Some(Duration::days(7)),
            },
        );
        let mut existing = record(Some("\"v1\""), Some(&hash));
        existing.hash_verified_at = Some(Utc::now() - Duration::days(8));
        let d = detector
            .detect(&candidate(meta(Some("\"v1\""), None, None)), Some(&existing), Utc::now())
            .await
            .unwrap();
        assert_eq!(d.method, Some(ChangeMethod::Hash));
        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_probe_is_gone() {
        let (_source, detector) = detector(b"abc", DetectionOptions::default());
        let existing = record(Some("\"v1\""), None);
        let mut c = candidate(meta(None, None, None));
        c.probe = ProbeOutcome::Missing { status: 410 };
        let d = detector.detect(&c, Some(&existing), Utc::now()).await.unwrap();
        assert_eq!(d.decision, ChangeDecision::Gone);
    }

    #[test]
    fn test_forced_detection() {
        let c = candidate(meta(Some("\"v1\""), None, None));
        let existing = record(Some("\"v1\""), None);
        assert_eq!(
            ChangeDetector::forced(&c, Some(&existing)).decision,
            ChangeDecision::Changed
        );
        assert_eq!(ChangeDetector::forced(&c, None).decision, ChangeDecision::New);
    }
}
