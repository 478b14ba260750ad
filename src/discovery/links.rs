//! Link extraction from seed listings.

use std::collections::HashSet;
use std::sync::LazyLock;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::normalize::normalize_url;

/// Absolute URLs anywhere in a text body (RDF attributes, JSON values).
static ABSOLUTE_URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>\\(){}\[\],]+"#).unwrap());

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href], link[href]").unwrap());

/// Default include patterns: document extensions the portal publishes.
pub const DEFAULT_INCLUDE_PATTERNS: &[&str] = &[
    r"(?i)\.xml$",
    r"(?i)\.json$",
    r"(?i)\.pdf$",
    r"(?i)\.rdf$",
    r"(?i)\.csv$",
];

/// Pull every raw link out of a listing body, in document order.
pub fn extract_raw_links(body: &str) -> Vec<String> {
    let trimmed = body.trim_start();

    if looks_like_html(trimmed) {
        let document = Html::parse_document(body);
        return document
            .select(&LINK_SELECTOR)
            .filter_map(|element| element.value().attr("href"))
            .map(String::from)
            .collect();
    }

    if trimmed.starts_with('<') {
        return xml_links(trimmed);
    }

    // JSON may escape slashes.
    let text = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        body.replace("\\/", "/")
    } else {
        body.to_string()
    };
    ABSOLUTE_URL_PATTERN
        .find_iter(&text)
        .map(|m| m.as_str().trim_end_matches(['.', ';']).to_string())
        .collect()
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<a ")
}

/// Sitemap `<loc>` text plus any absolute URL held in element text or
/// attributes (RDF `rdf:resource`, DCAT download URLs). Links read before a
/// parse error are kept.
fn xml_links(body: &str) -> Vec<String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut links = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => attribute_links(&e, &mut links),
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    push_absolute(text.trim(), &mut links);
                }
            }
            Ok(Event::CData(e)) => {
                push_absolute(String::from_utf8_lossy(&e).trim(), &mut links);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(
                    "Stopped reading XML listing at byte {}: {}",
                    reader.error_position(),
                    e
                );
                break;
            }
        }
    }
    links
}

fn attribute_links(element: &BytesStart<'_>, links: &mut Vec<String>) {
    for attr in element.attributes().flatten() {
        if let Ok(value) = attr.unescape_value() {
            push_absolute(value.trim(), links);
        }
    }
}

fn push_absolute(value: &str, links: &mut Vec<String>) {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    if (lower.starts_with("http://") || lower.starts_with("https://"))
        && !value.contains(char::is_whitespace)
    {
        links.push(value.to_string());
    }
}

/// Decides which extracted links become candidates.
#[derive(Debug, Clone)]
pub struct LinkFilter {
    include: Vec<Regex>,
    /// Hosts accepted besides the seed's own.
    extra_hosts: Vec<String>,
}

impl LinkFilter {
    pub fn new(include: Vec<Regex>, extra_hosts: Vec<String>) -> Self {
        Self {
            include,
            extra_hosts: extra_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Compile include patterns, failing on the first invalid one.
    pub fn from_patterns(patterns: &[String], extra_hosts: Vec<String>) -> Result<Self, regex::Error> {
        let include = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(include, extra_hosts))
    }

    /// Normalize, filter and deduplicate the raw links of one seed, keeping
    /// first-seen order. `limit = 0` means unlimited.
    pub fn select(&self, seed: &Url, raw_links: &[String], limit: usize) -> Vec<String> {
        let seed_host = seed.host_str().map(|h| h.to_ascii_lowercase());
        let mut seen = HashSet::new();
        let mut selected = Vec::new();

        for raw in raw_links {
            let Some(url) = normalize_url(raw, Some(seed)) else {
                continue;
            };
            let Ok(parsed) = Url::parse(&url) else {
                continue;
            };

            let host = parsed.host_str().map(|h| h.to_ascii_lowercase());
            let host_allowed = host == seed_host
                || host
                    .as_deref()
                    .is_some_and(|h| self.extra_hosts.iter().any(|e| e == h));
            if !host_allowed || !self.is_included(parsed.path()) {
                continue;
            }

            if seen.insert(url.clone()) {
                selected.push(url);
                if limit > 0 && selected.len() >= limit {
                    break;
                }
            }
        }

        selected
    }

    fn is_included(&self, path: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(path))
    }
}

impl Default for LinkFilter {
    fn default() -> Self {
        let include = DEFAULT_INCLUDE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self::new(include, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"<!DOCTYPE html>
<html><head><link rel="alternate" href="/feeds/deputati.rdf"></head>
<body>
  <a href="deputati.xml">Deputati</a>
  <a href="./deputati.xml#top">Deputati again</a>
  <a href="https://other.example.com/x.json">Elsewhere</a>
  <a href="/about.html">About</a>
  <a href="/votazioni.json?leg=19&amp;page=1">Votes</a>
</body></html>"#;

    fn seed() -> Url {
        Url::parse("https://dati.example.org/opendata/").unwrap()
    }

    #[test]
    fn test_html_links_filtered_and_deduplicated() {
        let raw = extract_raw_links(HTML);
        let selected = LinkFilter::default().select(&seed(), &raw, 0);
        assert_eq!(
            selected,
            vec![
                "https://dati.example.org/feeds/deputati.rdf".to_string(),
                "https://dati.example.org/opendata/deputati.xml".to_string(),
                "https://dati.example.org/votazioni.json?leg=19&page=1".to_string(),
            ]
        );
    }

    #[test]
    fn test_sitemap_locs() {
        let xml = r#"<?xml version="1.0"?>
<urlset>
  <url><loc>https://dati.example.org/sedute/leg19.xml</loc></url>
  <url><loc>
    https://dati.example.org/sedute/leg18.xml
  </loc></url>
</urlset>"#;
        let raw = extract_raw_links(xml);
        let selected = LinkFilter::default().select(&seed(), &raw, 0);
        assert_eq!(selected.len(), 2);
        assert!(selected.contains(&"https://dati.example.org/sedute/leg18.xml".to_string()));
    }

    #[test]
    fn test_xml_entities_and_attributes() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE urlset [ <!ENTITY portal "dati.example.org"> ]>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
  <dcat:Distribution rdf:about="https://dati.example.org/atti/leg19.rdf">
    <dcat:downloadURL rdf:resource="https://dati.example.org/votazioni.json?leg=19&amp;page=2"/>
  </dcat:Distribution>
  <loc><![CDATA[https://dati.example.org/sedute/leg17.xml]]></loc>
  <loc>https://dati.example.org/atti.csv?a=1&amp;b=2</loc>
</rdf:RDF>"#;
        let raw = extract_raw_links(xml);
        assert!(raw.contains(&"https://dati.example.org/votazioni.json?leg=19&page=2".to_string()));
        assert!(raw.contains(&"https://dati.example.org/atti.csv?a=1&b=2".to_string()));
        assert!(raw.contains(&"https://dati.example.org/sedute/leg17.xml".to_string()));
        assert!(!raw.iter().any(|l| l.contains("&amp;")));

        let selected = LinkFilter::default().select(&seed(), &raw, 0);
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn test_json_escaped_urls() {
        let json = r#"{"resources":[{"url":"https:\/\/dati.example.org\/atti\/leg19.csv"}]}"#;
        let raw = extract_raw_links(json);
        let selected = LinkFilter::default().select(&seed(), &raw, 0);
        assert_eq!(
            selected,
            vec!["https://dati.example.org/atti/leg19.csv".to_string()]
        );
    }

    #[test]
    fn test_extra_hosts_and_limit() {
        let raw = extract_raw_links(HTML);
        let filter = LinkFilter::new(
            vec![Regex::new(r"\.(xml|json|rdf)$").unwrap()],
            vec!["Other.Example.com".to_string()],
        );
        let selected = filter.select(&seed(), &raw, 2);
        assert_eq!(selected.len(), 2);

        let all = filter.select(&seed(), &raw, 0);
        assert!(all.contains(&"https://other.example.com/x.json".to_string()));
    }
}
