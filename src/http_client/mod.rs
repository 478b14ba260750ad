//! HTTP client for the open-data portal: conditional probes, paced requests
//! and resumable downloads.

mod response;

pub use response::{header_metadata, parse_retry_after, HeadResponse, Headers, HttpResponse};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::models::{Fingerprint, RemoteMetadata};
use crate::rate_limit::RateLimiter;
use crate::source::{FetchError, FetchedContent, RemoteSource};

/// Default user agent.
pub const USER_AGENT: &str = concat!("parlsync/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed [`RemoteSource`].
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter,
    /// Range requests allowed to finish one interrupted body.
    max_resumes: u32,
}

impl HttpClient {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        rate_limiter: RateLimiter,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            rate_limiter,
            max_resumes: 3,
        })
    }

    pub fn with_max_resumes(mut self, max_resumes: u32) -> Self {
        self.max_resumes = max_resumes;
        self
    }

    /// GET with optional conditional headers.
    pub async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(lm) = last_modified {
            request = request.header("If-Modified-Since", lm);
        }
        self.send(url, "GET", request).await
    }

    /// GET the remainder of a body from `offset`.
    async fn get_range(
        &self,
        url: &str,
        offset: usize,
        etag: Option<&str>,
    ) -> Result<HttpResponse, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header("Range", format!("bytes={}-", offset));
        if let Some(etag) = etag {
            request = request.header("If-Range", etag);
        }
        self.send(url, "GET", request).await
    }

    /// HEAD with optional conditional headers.
    pub async fn head(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<HeadResponse, FetchError> {
        let mut request = self.client.head(url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }
        if let Some(lm) = last_modified {
            request = request.header("If-Modified-Since", lm);
        }
        let response = self.send(url, "HEAD", request).await?;
        Ok(HeadResponse {
            status: response.status,
            headers: response.headers,
        })
    }

    async fn send(
        &self,
        url: &str,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, FetchError> {
        let domain = self.rate_limiter.acquire(url).await;

        let response = request.send().await.map_err(|e| map_reqwest_error(url, e))?;
        let status = response.status();
        debug!("{} {} -> {}", method, url, status.as_u16());

        if let Some(ref domain) = domain {
            self.rate_limiter.report_status(domain, status.as_u16()).await;
        }

        let headers = response::collect_headers(&response);
        Ok(HttpResponse {
            status,
            headers,
            response,
        })
    }

    /// Download the whole body, resuming with byte ranges when the
    /// connection drops and the server allows it.
    ///
    /// Resuming needs byte-accurate offsets, so it is only attempted when the
    /// body arrived unencoded with a known length.
    async fn download(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let mut response = self.get(url, None, None).await?;
        ensure_success(url, &response.status, response.retry_after())?;

        let metadata = response.metadata();
        let expected_len = response.content_length();
        let resumable = response.accepts_ranges() && expected_len.is_some();
        let etag = metadata.etag.clone();

        let mut body: Vec<u8> = Vec::with_capacity(expected_len.unwrap_or(0) as usize);
        let mut resumes = 0;

        loop {
            match response.next_chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    if !resumable || resumes >= self.max_resumes {
                        return Err(map_reqwest_error(url, e));
                    }
                    resumes += 1;
                    warn!(
                        "Body of {} interrupted at {} bytes ({}), resuming",
                        url,
                        body.len(),
                        e
                    );
                    response = self.get_range(url, body.len(), etag.as_deref()).await?;
                    match response.status {
                        StatusCode::PARTIAL_CONTENT => {}
                        // The representation changed or ranges were ignored: start over.
                        StatusCode::OK => body.clear(),
                        status => ensure_success(url, &status, response.retry_after())?,
                    }
                }
            }
        }

        if let Some(expected) = expected_len {
            if resumable && body.len() as u64 != expected {
                return Err(FetchError::Network {
                    url: url.to_string(),
                    message: format!("expected {} bytes, got {}", expected, body.len()),
                });
            }
        }

        let metadata = RemoteMetadata {
            content_length: Some(body.len() as u64),
            ..metadata
        };
        Ok(FetchedContent {
            bytes: body,
            metadata,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpClient {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url, None, None).await?;
        ensure_success(url, &response.status, response.retry_after())?;
        response.text().await.map_err(|e| map_reqwest_error(url, e))
    }

    async fn probe(
        &self,
        url: &str,
        known: Option<&Fingerprint>,
    ) -> Result<RemoteMetadata, FetchError> {
        let etag = known.and_then(|f| f.etag.as_deref());
        let last_modified = known.and_then(|f| f.last_modified.as_deref());

        let head = self.head(url, etag, last_modified).await?;
        let (status, metadata, retry_after) = if head.is_head_refused() {
            debug!("HEAD refused by {}, probing with conditional GET", url);
            // The body is never read; dropping the response closes it.
            let response = self.get(url, etag, last_modified).await?;
            (response.status, response.metadata(), response.retry_after())
        } else {
            (head.status, head.metadata(), head.retry_after())
        };

        if status == StatusCode::NOT_MODIFIED {
            return Ok(fill_not_modified(metadata, known));
        }
        ensure_success(url, &status, retry_after)?;
        Ok(metadata)
    }

    async fn fetch_content(&self, url: &str) -> Result<FetchedContent, FetchError> {
        self.download(url).await
    }
}

/// A 304 confirms the validators we sent; carry them into the result.
fn fill_not_modified(metadata: RemoteMetadata, known: Option<&Fingerprint>) -> RemoteMetadata {
    let Some(known) = known else {
        return metadata;
    };
    RemoteMetadata {
        etag: metadata.etag.or_else(|| known.etag.clone()),
        last_modified: metadata
            .last_modified
            .or_else(|| known.last_modified.clone()),
        content_length: metadata.content_length.or(known.size),
        ..metadata
    }
}

fn ensure_success(
    url: &str,
    status: &StatusCode,
    retry_after: Option<Duration>,
) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            retry_after,
        })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_builder() {
        FetchError::InvalidUrl(url.to_string())
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_modified_keeps_known_validators() {
        let known = Fingerprint {
            etag: Some("\"v1\"".into()),
            last_modified: Some("Tue, 15 Nov 1994 08:12:31 GMT".into()),
            content_hash: None,
            size: Some(42),
        };
        let meta = fill_not_modified(
            RemoteMetadata {
                status: 304,
                ..Default::default()
            },
            Some(&known),
        );
        assert_eq!(meta.status, 304);
        assert_eq!(meta.etag, known.etag);
        assert_eq!(meta.last_modified, known.last_modified);
        assert_eq!(meta.content_length, Some(42));
    }

    #[test]
    fn test_ensure_success_carries_retry_after() {
        let err = ensure_success(
            "https://dati.example.org/a.xml",
            &StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
        )
        .unwrap_err();
        assert_eq!(
            err,
            FetchError::Status {
                url: "https://dati.example.org/a.xml".into(),
                status: 429,
                retry_after: Some(Duration::from_secs(7)),
            }
        );
        assert!(ensure_success("x", &StatusCode::OK, None).is_ok());
    }

    #[test]
    fn test_client_builds() {
        let client = HttpClient::new(USER_AGENT, Duration::from_secs(5), RateLimiter::new());
        assert!(client.is_ok());
    }
}
