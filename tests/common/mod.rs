//! In-memory remote portal and settings shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use parlsync::cancel::CancelSignal;
use parlsync::config::Settings;
use parlsync::discovery::{normalize_url, Seed};
use parlsync::models::{Fingerprint, RemoteMetadata};
use parlsync::pipeline::{Pipeline, RunOptions, RunReport};
use parlsync::retry::{CircuitConfig, RetryPolicy};
use parlsync::source::{FetchError, FetchedContent, RemoteSource};

pub const HOST: &str = "https://dati.example.org";

pub fn url(path: &str) -> String {
    format!("{}{}", HOST, path)
}

#[derive(Debug, Clone)]
struct Published {
    body: Vec<u8>,
    etag: String,
}

/// A portal whose listings and documents tests edit between runs.
#[derive(Default)]
pub struct FakeSource {
    listings: Mutex<HashMap<String, Option<String>>>,
    documents: Mutex<HashMap<String, Published>>,
    /// Remaining transient failures per document URL.
    failures: Mutex<HashMap<String, u32>>,
    downloads: AtomicUsize,
    /// Downloads hang once started while set.
    stalled: AtomicBool,
    download_started: Notify,
}

fn key(raw: &str) -> String {
    normalize_url(raw, None).unwrap_or_else(|| raw.to_string())
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `links` as an HTML listing at `seed`.
    pub fn list(&self, seed: &str, links: &[&str]) {
        let anchors: String = links
            .iter()
            .map(|l| format!("<a href=\"{}\">{}</a>\n", l, l))
            .collect();
        let body = format!("<!DOCTYPE html><html><body>\n{}</body></html>", anchors);
        self.listings.lock().unwrap().insert(key(seed), Some(body));
    }

    /// Make the listing at `seed` answer 500.
    pub fn break_listing(&self, seed: &str) {
        self.listings.lock().unwrap().insert(key(seed), None);
    }

    pub fn publish(&self, url: &str, body: &str, etag: &str) {
        self.documents.lock().unwrap().insert(
            key(url),
            Published {
                body: body.as_bytes().to_vec(),
                etag: etag.to_string(),
            },
        );
    }

    pub fn unpublish(&self, url: &str) {
        self.documents.lock().unwrap().remove(&key(url));
    }

    /// The next `times` downloads of `url` fail with a 503.
    pub fn fail_downloads(&self, url: &str, times: u32) {
        self.failures.lock().unwrap().insert(key(url), times);
    }

    /// Make downloads hang until the caller gives up on them.
    pub fn stall_downloads(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Resolves once a stalled download is in flight.
    pub async fn download_in_flight(&self) {
        self.download_started.notified().await;
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn published(&self, url: &str) -> Result<Published, FetchError> {
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
                retry_after: None,
            })
    }
}

fn metadata(doc: &Published) -> RemoteMetadata {
    RemoteMetadata {
        status: 200,
        etag: Some(doc.etag.clone()),
        last_modified: None,
        content_length: Some(doc.body.len() as u64),
        content_type: Some("application/xml".to_string()),
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        match self.listings.lock().unwrap().get(url) {
            Some(Some(body)) => Ok(body.clone()),
            Some(None) => Err(FetchError::Status {
                url: url.to_string(),
                status: 500,
                retry_after: None,
            }),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
                retry_after: None,
            }),
        }
    }

    async fn probe(
        &self,
        url: &str,
        _known: Option<&Fingerprint>,
    ) -> Result<RemoteMetadata, FetchError> {
        self.published(url).map(|doc| metadata(&doc))
    }

    async fn fetch_content(&self, url: &str) -> Result<FetchedContent, FetchError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            self.download_started.notify_one();
            std::future::pending::<()>().await;
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: 503,
                        retry_after: None,
                    });
                }
            }
        }
        let doc = self.published(url)?;
        Ok(FetchedContent {
            metadata: metadata(&doc),
            bytes: doc.body,
        })
    }
}

pub fn xml(root: &str, id: u32) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{root}><item id=\"{id}\"/></{root}>",
        root = root,
        id = id
    )
}

/// Settings for a temp data dir with retries fast enough for tests.
pub fn settings(dir: &Path, seeds: &[&str]) -> Settings {
    let mut settings = Settings::with_data_dir(dir.to_path_buf());
    settings.seeds = seeds
        .iter()
        .enumerate()
        .map(|(i, url)| Seed {
            name: format!("seed{}", i),
            url: url.to_string(),
            section: None,
            legislature: Some("leg19".to_string()),
        })
        .collect();
    settings.retry = RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: 2,
        jitter: 0.0,
        max_rate_limit_wait: Duration::from_millis(10),
    };
    settings.circuit = CircuitConfig {
        failure_threshold: 100,
        ..Default::default()
    };
    settings.import.workers = 2;
    settings.import.max_attempts = 3;
    settings
}

pub fn pipeline(settings: &Settings, source: &Arc<FakeSource>) -> Pipeline {
    let db = settings.create_db_context().unwrap();
    Pipeline::new(settings, db, source.clone()).unwrap()
}

pub async fn run(pipeline: &Pipeline, options: RunOptions) -> RunReport {
    pipeline
        .run(options, CancelSignal::never(), None)
        .await
        .unwrap()
}

/// Wait past the (millisecond) backoff of failed imports.
pub async fn past_backoff() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}
