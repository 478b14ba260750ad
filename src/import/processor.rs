//! Payload validation and storage.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::bytes::Regex;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::SyncError;
use crate::repository::NewPayload;
use crate::source::FetchedContent;

static PDF_PAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/Type\s*/Page\b").unwrap());

/// One downloaded resource handed to a processor.
#[derive(Debug, Clone, Copy)]
pub struct ImportItem<'a> {
    pub url: &'a str,
    pub content_hash: &'a str,
    pub content: &'a FetchedContent,
}

/// Turns a downloaded resource into a stored payload.
#[async_trait]
pub trait ResourceProcessor: Send + Sync {
    /// Validate and store the payload. Invalid content is a permanent
    /// [`SyncError::Processing`].
    async fn process(&self, item: ImportItem<'_>) -> Result<NewPayload, SyncError>;
}

/// Formats the default processor knows how to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Xml,
    Pdf,
    Csv,
    Other,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Other => "other",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Other => "bin",
            other => other.as_str(),
        }
    }

    /// Pick a format from the URL extension, then the content type, then the bytes.
    pub fn detect(url: &str, content_type: Option<&str>, bytes: &[u8]) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".json") {
            return Self::Json;
        }
        if path.ends_with(".xml") || path.ends_with(".rdf") {
            return Self::Xml;
        }
        if path.ends_with(".pdf") {
            return Self::Pdf;
        }
        if path.ends_with(".csv") {
            return Self::Csv;
        }

        if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
            if ct.contains("json") {
                return Self::Json;
            }
            if ct.contains("xml") {
                return Self::Xml;
            }
            if ct.contains("pdf") {
                return Self::Pdf;
            }
            if ct.contains("csv") {
                return Self::Csv;
            }
        }

        let head = trim_start(bytes);
        if head.starts_with(b"%PDF-") {
            Self::Pdf
        } else if head.starts_with(b"{") || head.starts_with(b"[") {
            Self::Json
        } else if head.starts_with(b"<") {
            Self::Xml
        } else {
            Self::Other
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Pdf => "application/pdf",
            Self::Csv => "text/csv",
            Self::Other => "application/octet-stream",
        }
    }
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Validate `bytes` as `format` and summarize them.
pub fn summarize(format: PayloadFormat, bytes: &[u8]) -> Result<serde_json::Value, String> {
    match format {
        PayloadFormat::Json => {
            let value: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {}", e))?;
            Ok(match &value {
                serde_json::Value::Object(map) => json!({
                    "format": "json",
                    "keys": map.keys().take(20).collect::<Vec<_>>(),
                }),
                serde_json::Value::Array(items) => json!({
                    "format": "json",
                    "items": items.len(),
                }),
                _ => json!({ "format": "json" }),
            })
        }
        PayloadFormat::Xml => {
            let root = xml_root(bytes)?;
            Ok(json!({ "format": "xml", "root": root }))
        }
        PayloadFormat::Pdf => {
            if !trim_start(bytes).starts_with(b"%PDF-") {
                return Err("missing %PDF- header".to_string());
            }
            let pages = PDF_PAGE.find_iter(bytes).count();
            Ok(json!({ "format": "pdf", "page_count_hint": pages }))
        }
        PayloadFormat::Csv => csv_summary(bytes),
        PayloadFormat::Other => Ok(json!({ "format": "other" })),
    }
}

/// Name of the root element. The document must parse to the end with
/// exactly one balanced root.
fn xml_root(bytes: &[u8]) -> Result<String, String> {
    let mut reader = Reader::from_reader(trim_start(bytes));
    reader.config_mut().trim_text(true);

    let mut root: Option<String> = None;
    let mut depth = 0usize;
    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("invalid XML at byte {}: {}", reader.error_position(), e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) if depth == 0 => {
                if let Some(first) = &root {
                    return Err(format!("content after root element <{}>", first));
                }
                root = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                if matches!(event, Event::Start(_)) {
                    depth = 1;
                }
            }
            Event::Start(_) => depth += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(_) | Event::CData(_) if depth == 0 => {
                return Err("text outside the root element".to_string());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match root {
        Some(root) if depth == 0 => Ok(root),
        Some(root) => Err(format!("root element <{}> is not closed", root)),
        None => Err("no XML root element".to_string()),
    }
}

/// Column and row counts; `;` is picked over `,` when the header has more of them.
fn csv_summary(bytes: &[u8]) -> Result<serde_json::Value, String> {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let header_line = body.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |c: u8| header_line.iter().filter(|b| **b == c).count();
    let delimiter = if count(b';') > count(b',') { b';' } else { b',' };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(body);
    let columns = reader
        .headers()
        .map_err(|e| format!("invalid CSV: {}", e))?
        .len();
    if columns == 0 {
        return Err("empty CSV".to_string());
    }
    let mut rows = 0usize;
    for record in reader.records() {
        record.map_err(|e| format!("invalid CSV: {}", e))?;
        rows += 1;
    }
    Ok(json!({
        "format": "csv",
        "columns": columns,
        "rows": rows,
    }))
}

/// Default processor: validates by format and writes content-addressed files
/// under `{data_dir}/payloads/`.
#[derive(Debug, Clone)]
pub struct PayloadProcessor {
    data_dir: PathBuf,
}

impl PayloadProcessor {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Path of a payload relative to the data directory.
    pub fn relative_path(content_hash: &str, format: PayloadFormat) -> PathBuf {
        let prefix = content_hash.get(..2).unwrap_or("00");
        Path::new("payloads")
            .join(prefix)
            .join(format!("{}.{}", content_hash, format.extension()))
    }
}

#[async_trait]
impl ResourceProcessor for PayloadProcessor {
    async fn process(&self, item: ImportItem<'_>) -> Result<NewPayload, SyncError> {
        let bytes = &item.content.bytes;
        let declared = item.content.metadata.content_type.as_deref();
        let format = PayloadFormat::detect(item.url, declared, bytes);

        let mut summary = summarize(format, bytes).map_err(|message| SyncError::Processing {
            message: format!("{}: {}", item.url, message),
            permanent: true,
        })?;
        summary["bytes"] = json!(bytes.len());

        let relative = Self::relative_path(item.content_hash, format);
        let absolute = self.data_dir.join(&relative);
        if !tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_error)?;
            }
            // Write then rename so a crash never leaves a truncated payload.
            let partial = absolute.with_extension(format!("{}.part", Uuid::new_v4()));
            tokio::fs::write(&partial, bytes).await.map_err(io_error)?;
            tokio::fs::rename(&partial, &absolute)
                .await
                .map_err(io_error)?;
        }
        debug!("Stored {} as {}", item.url, relative.display());

        Ok(NewPayload {
            content_type: declared
                .map(String::from)
                .unwrap_or_else(|| format.content_type().to_string()),
            storage_path: relative.to_string_lossy().replace('\\', "/"),
            summary,
        })
    }
}

fn io_error(err: std::io::Error) -> SyncError {
    SyncError::Processing {
        message: format!("failed to store payload: {}", err),
        permanent: false,
    }
}
