//! Pattern-based classification of candidate URLs.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::Seed;
use crate::models::{Classification, UNCLASSIFIED};

/// Fallback for the legislature term when no rule names it: `leg19`,
/// `legislatura-18`, `leg_XVII` style path segments.
static LEGISLATURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bleg(?:islatura|islature)?[_-]?(\d{1,2}|[ivxlc]{1,6})\b").unwrap()
});

/// One classification rule.
///
/// `pattern` is matched against the URL path plus query. Its named groups
/// `section`, `data_type` and `legislature` take precedence over the static
/// values below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legislature: Option<String>,
}

impl ClassificationRule {
    fn with_type(pattern: &str, data_type: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            section: None,
            data_type: Some(data_type.to_string()),
            legislature: None,
        }
    }
}

/// Rules covering the usual sections of a parliamentary open-data portal.
pub fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::with_type(
            r"(?i)/(?P<section>deputati|senatori|members?)(?:/|[._-])",
            "member",
        ),
        ClassificationRule::with_type(
            r"(?i)/(?P<section>sedute|resoconti|sessions?)(?:/|[._-])",
            "session",
        ),
        ClassificationRule::with_type(r"(?i)/(?P<section>votazioni|votes?)(?:/|[._-])", "vote"),
        ClassificationRule::with_type(r"(?i)/(?P<section>atti|ddl|bills?)(?:/|[._-])", "bill"),
        ClassificationRule::with_type(
            r"(?i)/(?P<section>commissioni|committees?)(?:/|[._-])",
            "committee",
        ),
    ]
}

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    rule: ClassificationRule,
}

/// Applies classification rules in order; the first complete match wins.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

impl Classifier {
    pub fn new(rules: &[ClassificationRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: Regex::new(&rule.pattern)?,
                    rule: rule.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Classify a normalized URL. The error is the reason no rule applied.
    pub fn classify(&self, url: &str, seed: &Seed) -> Result<Classification, String> {
        let parsed = Url::parse(url).map_err(|e| format!("unparseable URL: {}", e))?;
        let target = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };
        let content_type = guess_content_type(&parsed);

        for compiled in &self.rules {
            let Some(caps) = compiled.regex.captures(&target) else {
                continue;
            };
            let group = |name: &str| caps.name(name).map(|m| m.as_str().to_ascii_lowercase());
            let rule = &compiled.rule;

            let section = group("section")
                .or_else(|| rule.section.clone())
                .or_else(|| seed.section.clone());
            let data_type = group("data_type").or_else(|| rule.data_type.clone());
            let (Some(section_name), Some(data_type)) = (section, data_type) else {
                continue;
            };

            let legislature_tag = group("legislature")
                .map(|l| legislature_tag(&l))
                .or_else(|| rule.legislature.clone())
                .or_else(|| seed.legislature.clone())
                .or_else(|| detect_legislature(&target))
                .unwrap_or_else(|| UNCLASSIFIED.to_string());

            return Ok(Classification {
                section_name,
                data_type,
                legislature_tag,
                content_type,
            });
        }

        Err(format!("no classification rule matched {}", target))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        let rules = default_rules()
            .into_iter()
            .filter_map(|rule| {
                Regex::new(&rule.pattern)
                    .ok()
                    .map(|regex| CompiledRule { regex, rule })
            })
            .collect();
        Self { rules }
    }
}

/// Content type implied by the URL's extension.
pub fn guess_content_type(url: &Url) -> String {
    mime_guess::from_path(url.path())
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn detect_legislature(target: &str) -> Option<String> {
    LEGISLATURE_PATTERN
        .captures(target)
        .map(|caps| legislature_tag(&caps[1]))
}

/// Canonical legislature tag: `19`, `xix` and `leg19` all become `leg19`.
fn legislature_tag(raw: &str) -> String {
    let raw = raw.trim().to_ascii_lowercase();
    let raw = raw.strip_prefix("leg").unwrap_or(&raw);
    let number = raw.parse::<u32>().ok().or_else(|| roman_to_u32(raw));
    match number {
        Some(n) => format!("leg{}", n),
        None => raw.to_string(),
    }
}

fn roman_to_u32(s: &str) -> Option<u32> {
    let value = |c| match c {
        'i' => Some(1),
        'v' => Some(5),
        'x' => Some(10),
        'l' => Some(50),
        'c' => Some(100),
        _ => None,
    };
    let digits: Vec<u32> = s.chars().map(value).collect::<Option<_>>()?;
    if digits.is_empty() {
        return None;
    }
    let mut total = 0;
    for (i, d) in digits.iter().enumerate() {
        match digits.get(i + 1) {
            Some(next) if next > d => total -= *d as i64,
            _ => total += *d as i64,
        }
    }
    u32::try_from(total).ok().filter(|n| *n > 0)
}
