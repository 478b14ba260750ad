//! Discovery: turn seed listings into classified, probed candidates.
//!
//! Each run starts from the seeds; nothing is carried over between runs.
//! Seeds are crawled concurrently and every seed ends with either
//! [`DiscoveryEvent::SeedCompleted`] or [`DiscoveryEvent::SeedFailed`], which
//! is what the orchestrator needs to infer deletions safely.

mod classify;
mod links;
mod normalize;

pub use classify::{default_rules, guess_content_type, ClassificationRule, Classifier};
pub use links::{extract_raw_links, LinkFilter, DEFAULT_INCLUDE_PATTERNS};
pub use normalize::normalize_url;

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SyncError;
use crate::models::{CandidateResource, Classification, Fingerprint, ProbeOutcome};
use crate::retry::{RetryError, RetryScheduler};
use crate::source::{FetchError, RemoteSource};

/// A listing URL to crawl, with optional classification defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub name: String,
    pub url: String,
    /// Section assumed for resources of this seed when a rule does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Legislature assumed when neither a rule nor the URL names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legislature: Option<String>,
}

/// Discovery concurrency and limits.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Seeds crawled at once.
    pub concurrency: usize,
    /// Probes in flight per seed.
    pub probe_concurrency: usize,
    /// Candidates kept per seed, 0 for unlimited.
    pub max_candidates_per_seed: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            probe_concurrency: 4,
            max_candidates_per_seed: 0,
        }
    }
}

/// Output of a discovery run.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Candidate(CandidateResource),
    /// Every link of the seed was emitted; `seed` is the normalized seed URL.
    SeedCompleted { seed: String, candidates: usize },
    /// The listing could not be fetched; its resources must not be inferred gone.
    SeedFailed { seed: String, error: String },
}

/// Validators already stored for known resources, keyed by normalized URL.
pub type KnownFingerprints = HashMap<String, Fingerprint>;

/// Crawls seeds through a [`RemoteSource`].
pub struct DiscoveryEngine {
    source: Arc<dyn RemoteSource>,
    scheduler: RetryScheduler,
    filter: LinkFilter,
    classifier: Classifier,
    options: DiscoveryOptions,
}

impl DiscoveryEngine {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        scheduler: RetryScheduler,
        filter: LinkFilter,
        classifier: Classifier,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            source,
            scheduler,
            filter,
            classifier,
            options,
        }
    }

    /// Discover candidates from `seeds`.
    ///
    /// The stream is finite. Dropping it cancels in-flight requests.
    pub fn discover<'a>(
        &'a self,
        seeds: &'a [Seed],
        known: &'a KnownFingerprints,
    ) -> impl Stream<Item = DiscoveryEvent> + 'a {
        stream::iter(seeds)
            .map(move |seed| self.discover_seed(seed, known))
            .buffer_unordered(self.options.concurrency.max(1))
            .flat_map(stream::iter)
    }

    async fn discover_seed(&self, seed: &Seed, known: &KnownFingerprints) -> Vec<DiscoveryEvent> {
        let Some(seed_url) = normalize_url(&seed.url, None) else {
            warn!("Seed {} has an invalid URL: {}", seed.name, seed.url);
            return vec![DiscoveryEvent::SeedFailed {
                seed: seed.url.clone(),
                error: "invalid seed URL".to_string(),
            }];
        };
        let Ok(parsed_seed) = Url::parse(&seed_url) else {
            return vec![DiscoveryEvent::SeedFailed {
                seed: seed_url,
                error: "invalid seed URL".to_string(),
            }];
        };

        let listing = self
            .scheduler
            .execute(&seed_url, || self.source.fetch_listing(&seed_url), FetchError::classify)
            .await;
        let body = match listing {
            Ok(body) => body,
            Err(e) => {
                warn!("Seed {} failed: {}", seed.name, e);
                return vec![DiscoveryEvent::SeedFailed {
                    seed: seed_url,
                    error: e.to_string(),
                }];
            }
        };

        let raw = extract_raw_links(&body);
        let urls = self
            .filter
            .select(&parsed_seed, &raw, self.options.max_candidates_per_seed);
        debug!(
            "Seed {}: {} links extracted, {} selected",
            seed.name,
            raw.len(),
            urls.len()
        );

        let candidates: Vec<CandidateResource> = stream::iter(urls)
            .map(|url| self.build_candidate(url, &seed_url, seed, known))
            .buffered(self.options.probe_concurrency.max(1))
            .collect()
            .await;

        info!("Seed {} completed: {} candidates", seed.name, candidates.len());
        let count = candidates.len();
        let mut events: Vec<DiscoveryEvent> = candidates
            .into_iter()
            .map(DiscoveryEvent::Candidate)
            .collect();
        events.push(DiscoveryEvent::SeedCompleted {
            seed: seed_url,
            candidates: count,
        });
        events
    }

    async fn build_candidate(
        &self,
        url: String,
        seed_url: &str,
        seed: &Seed,
        known: &KnownFingerprints,
    ) -> CandidateResource {
        let mut classification = match self.classifier.classify(&url, seed) {
            Ok(c) => c,
            Err(reason) => {
                let content_type = Url::parse(&url)
                    .map(|u| guess_content_type(&u))
                    .unwrap_or_else(|_| "application/octet-stream".to_string());
                let err = SyncError::Classification {
                    url: url.clone(),
                    reason,
                };
                warn!("{}", err);
                Classification::unclassified(content_type)
            }
        };

        let fingerprint = known.get(&url);
        let probe = self
            .scheduler
            .execute(&url, || self.source.probe(&url, fingerprint), FetchError::classify)
            .await;

        let probe = match probe {
            Ok(meta) => {
                if classification.content_type == "application/octet-stream" {
                    if let Some(ct) = &meta.content_type {
                        classification.content_type = ct.clone();
                    }
                }
                ProbeOutcome::Found(meta)
            }
            Err(RetryError::Fatal(e)) if e.is_missing() => ProbeOutcome::Missing {
                status: e.status().unwrap_or(404),
            },
            Err(e) => {
                warn!("Probe failed for {}: {}", url, e);
                ProbeOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        CandidateResource {
            url,
            seed_url: seed_url.to_string(),
            classification,
            probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteMetadata;
    use crate::retry::{CircuitConfig, RetryPolicy};
    use crate::source::FetchedContent;
    use async_trait::async_trait;
    use std::time::Duration;

    struct MapSource {
        listings: HashMap<String, Result<String, FetchError>>,
        probes: HashMap<String, Result<RemoteMetadata, FetchError>>,
    }

    #[async_trait]
    impl RemoteSource for MapSource {
        async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
            self.listings
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(status_error(url, 404)))
        }

        async fn probe(
            &self,
            url: &str,
            _known: Option<&Fingerprint>,
        ) -> Result<RemoteMetadata, FetchError> {
            self.probes
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(status_error(url, 404)))
        }

        async fn fetch_content(&self, url: &str) -> Result<FetchedContent, FetchError> {
            Err(status_error(url, 404))
        }
    }

    fn status_error(url: &str, status: u16) -> FetchError {
        FetchError::Status {
            url: url.to_string(),
            status,
            retry_after: None,
        }
    }

    fn found() -> Result<RemoteMetadata, FetchError> {
        Ok(RemoteMetadata {
            status: 200,
            etag: Some("\"1\"".into()),
            ..Default::default()
        })
    }

    fn engine(source: MapSource) -> DiscoveryEngine {
        let scheduler = RetryScheduler::new(
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 2,
                ..Default::default()
            },
            CircuitConfig::default(),
        );
        DiscoveryEngine::new(
            Arc::new(source),
            scheduler,
            LinkFilter::default(),
            Classifier::default(),
            DiscoveryOptions::default(),
        )
    }

    fn seed(name: &str, url: &str) -> Seed {
        Seed {
            name: name.into(),
            url: url.into(),
            section: None,
            legislature: None,
        }
    }

    #[tokio::test]
    async fn test_discover_emits_candidates_and_seed_outcomes() {
        let listing = r#"<html><body>
            <a href="/deputati.xml">a</a>
            <a href="/deputati.xml?">dup</a>
            <a href="/gone.json">b</a>
            <a href="/down.pdf">c</a>
            <a href="/misc/readme.csv">d</a>
        </body></html>"#;
        let mut listings = HashMap::new();
        listings.insert("https://dati.example.org/".to_string(), Ok(listing.to_string()));
        listings.insert(
            "https://broken.example.org/".to_string(),
            Err(status_error("https://broken.example.org/", 500)),
        );

        let mut probes = HashMap::new();
        probes.insert("https://dati.example.org/deputati.xml".to_string(), found());
        probes.insert(
            "https://dati.example.org/down.pdf".to_string(),
            Err(status_error("https://dati.example.org/down.pdf", 502)),
        );
        probes.insert("https://dati.example.org/misc/readme.csv".to_string(), found());

        let engine = engine(MapSource { listings, probes });
        let seeds = vec![
            seed("camera", "https://dati.example.org/"),
            seed("broken", "https://broken.example.org/"),
        ];
        let known = KnownFingerprints::new();
        let events: Vec<DiscoveryEvent> = engine.discover(&seeds, &known).collect().await;

        let candidates: HashMap<String, CandidateResource> = events
            .iter()
            .filter_map(|e| match e {
                DiscoveryEvent::Candidate(c) => Some((c.url.clone(), c.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(candidates.len(), 4);

        let deputati = &candidates["https://dati.example.org/deputati.xml"];
        assert!(matches!(deputati.probe, ProbeOutcome::Found(_)));
        assert_eq!(deputati.classification.data_type, "member");
        assert_eq!(deputati.seed_url, "https://dati.example.org/");

        assert!(matches!(
            candidates["https://dati.example.org/gone.json"].probe,
            ProbeOutcome::Missing { status: 404 }
        ));
        assert!(matches!(
            candidates["https://dati.example.org/down.pdf"].probe,
            ProbeOutcome::Failed { .. }
        ));
        assert!(candidates["https://dati.example.org/misc/readme.csv"]
            .classification
            .is_unclassified());

        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::SeedCompleted { seed, candidates: 4 } if seed == "https://dati.example.org/"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DiscoveryEvent::SeedFailed { seed, .. } if seed == "https://broken.example.org/"
        )));
    }
}
