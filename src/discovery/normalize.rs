//! URL normalization: the normalized form is a resource's identity.

use url::Url;

/// Normalize `raw`, resolving it against `base` when relative.
///
/// Drops the fragment, orders query parameters by name, lower-cases the
/// host and removes default ports. Query bytes are never re-encoded. Returns `None` for anything that is not http(s).
pub fn normalize_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("javascript:")
        || raw.starts_with("mailto:")
        || raw.starts_with("tel:")
    {
        return None;
    }

    let mut url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    url.set_fragment(None);

    // Reorder the raw segments by key; the encoding the portal chose is kept.
    let mut segments: Vec<&str> = url
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|s| !s.is_empty())
        .collect();
    segments.sort_by(|a, b| query_key(a).cmp(query_key(b)));
    let query = (!segments.is_empty()).then(|| segments.join("&"));
    url.set_query(query.as_deref());

    Some(url.to_string())
}

fn query_key(segment: &str) -> &str {
    segment.split('=').next().unwrap_or(segment)
}
