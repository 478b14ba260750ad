//! HTTP response wrappers.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::models::{parse_http_date, RemoteMetadata};

/// Lower-cased response headers.
pub type Headers = HashMap<String, String>;

pub(crate) fn collect_headers(response: &Response) -> Headers {
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }
    headers
}

/// Metadata carried by a set of response headers.
pub fn header_metadata(status: StatusCode, headers: &Headers) -> RemoteMetadata {
    RemoteMetadata {
        status: status.as_u16(),
        etag: headers.get("etag").cloned(),
        last_modified: headers.get("last-modified").cloned(),
        content_length: headers.get("content-length").and_then(|s| s.trim().parse().ok()),
        content_type: headers
            .get("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string()),
    }
}

/// Parse a Retry-After value, either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = parse_http_date(value)?;
    let delta = at - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Response with a body still to be read.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub(crate) response: Response,
}

impl HttpResponse {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|s| s.parse().ok())
    }

    /// Server accepts byte ranges for this resource.
    pub fn accepts_ranges(&self) -> bool {
        self.headers
            .get("accept-ranges")
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| parse_retry_after(v))
    }

    pub fn metadata(&self) -> RemoteMetadata {
        header_metadata(self.status, &self.headers)
    }

    /// Next piece of the body, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, reqwest::Error> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|b| b.to_vec()))
    }

    pub async fn text(self) -> Result<String, reqwest::Error> {
        self.response.text().await
    }
}

/// HEAD response (headers only).
pub struct HeadResponse {
    pub status: StatusCode,
    pub headers: Headers,
}

impl HeadResponse {
    /// The server refuses HEAD for this resource.
    pub fn is_head_refused(&self) -> bool {
        matches!(self.status.as_u16(), 405 | 501)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| parse_retry_after(v))
    }

    pub fn metadata(&self) -> RemoteMetadata {
        header_metadata(self.status, &self.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_metadata() {
        let mut headers = Headers::new();
        headers.insert("etag".into(), "\"abc\"".into());
        headers.insert("content-length".into(), "1024".into());
        headers.insert("content-type".into(), "application/xml; charset=utf-8".into());

        let meta = header_metadata(StatusCode::OK, &headers);
        assert_eq!(meta.status, 200);
        assert_eq!(meta.etag.as_deref(), Some("\"abc\""));
        assert_eq!(meta.content_length, Some(1024));
        assert_eq!(meta.content_type.as_deref(), Some("application/xml"));
        assert_eq!(meta.last_modified, None);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Tue, 15 Nov 1994 08:12:31 GMT"),
            Some(Duration::ZERO)
        );
    }
}
