//! Configuration management for parlsync using the prefer crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detection::DetectionOptions;
use crate::discovery::{
    default_rules, ClassificationRule, DiscoveryOptions, Seed, DEFAULT_INCLUDE_PATTERNS,
};
use crate::http_client::{HttpClient, USER_AGENT};
use crate::import::ImportOptions;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::repository::{self, DbContext};
use crate::retry::{CircuitConfig, RetryPolicy, RetryScheduler};

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "parlsync.db";

/// Subdirectory of the data directory holding processed payloads.
pub const PAYLOADS_SUBDIR: &str = "payloads";

/// Application settings, fully resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// User agent for HTTP requests.
    pub user_agent: String,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Range requests allowed to finish one interrupted download.
    pub max_resumes: u32,
    pub seeds: Vec<Seed>,
    /// Regexes a link path must match to become a candidate.
    pub include: Vec<String>,
    /// Hosts accepted besides each seed's own.
    pub extra_hosts: Vec<String>,
    pub rules: Vec<ClassificationRule>,
    pub discovery: DiscoveryOptions,
    /// Change detections running at once.
    pub detect_concurrency: usize,
    pub detection: DetectionOptions,
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub import: ImportOptions,
}

impl Default for Settings {
    fn default() -> Self {
        // Default to ~/Documents/parlsync/, falling back to the home directory.
        let data_dir = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parlsync");

        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            user_agent: USER_AGENT.to_string(),
            request_timeout: 30,
            max_resumes: 3,
            seeds: Vec::new(),
            include: DEFAULT_INCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            extra_hosts: Vec::new(),
            rules: default_rules(),
            discovery: DiscoveryOptions::default(),
            detect_concurrency: 4,
            detection: DetectionOptions::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            rate_limit: RateLimitConfig::default(),
            import: ImportOptions::default(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Check if the database appears to be initialized.
    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    pub fn payloads_dir(&self) -> PathBuf {
        self.data_dir.join(PAYLOADS_SUBDIR)
    }

    /// Ensure the data directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })?;
        std::fs::create_dir_all(self.payloads_dir())
    }

    /// Open the database, creating its schema if needed.
    pub fn create_db_context(&self) -> repository::Result<DbContext> {
        DbContext::open(&self.database_path())
    }

    /// Retry scheduler with this configuration's policy and circuit breaker.
    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.retry.clone(), self.circuit.clone())
    }

    /// HTTP client with its own adaptive rate limiter.
    pub fn http_client(&self) -> Result<HttpClient, reqwest::Error> {
        let limiter = RateLimiter::with_config(self.rate_limit.clone());
        Ok(HttpClient::new(
            &self.user_agent,
            Duration::from_secs(self.request_timeout),
            limiter,
        )?
        .with_max_resumes(self.max_resumes))
    }
}

/// `[http]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    /// Delay between requests to one host in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resumes: Option<u32>,
}

/// `[discovery]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<Seed>,
    /// Replaces the default include patterns when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    /// Replaces the default classification rules when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ClassificationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detect_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates_per_seed: Option<usize>,
}

/// `[detection]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Always compare content hashes, ignoring header validators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_hash: Option<bool>,
    /// Re-verify by hash once the stored hash is older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_after_days: Option<u64>,
}

/// `[retry]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate_limit_wait_secs: Option<u64>,
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
}

/// `[rate_limit]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

/// `[import]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_timeout_secs: Option<u64>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub import: ImportConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer for discovery.
    /// Automatically discovers parlsync config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("parlsync").await {
            Ok(pref_config) => {
                if let Some(path) = pref_config.source_path() {
                    match Self::load_from_path(path).await {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::warn!("Ignoring config file: {}", e);
                            Self::default()
                        }
                    }
                } else {
                    Self::default()
                }
            }
            // No config file found.
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// The format follows the file extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse configuration text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> Result<Self, String> {
        match ext {
            "toml" => {
                toml::from_str(contents).map_err(|e| format!("Failed to parse TOML config: {}", e))
            }
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e)),
            _ => serde_json::from_str(contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e)),
        }
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }

        let http = &self.http;
        if let Some(ref user_agent) = http.user_agent {
            settings.user_agent = user_agent.clone();
        }
        if let Some(timeout) = http.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(delay) = http.request_delay_ms {
            settings.rate_limit.base_delay = Duration::from_millis(delay);
        }
        if let Some(resumes) = http.max_resumes {
            settings.max_resumes = resumes;
        }

        let discovery = &self.discovery;
        if !discovery.seeds.is_empty() {
            settings.seeds = discovery.seeds.clone();
        }
        if !discovery.include.is_empty() {
            settings.include = discovery.include.clone();
        }
        if !discovery.extra_hosts.is_empty() {
            settings.extra_hosts = discovery.extra_hosts.clone();
        }
        if !discovery.rules.is_empty() {
            settings.rules = discovery.rules.clone();
        }
        if let Some(n) = discovery.concurrency {
            settings.discovery.concurrency = n;
        }
        if let Some(n) = discovery.probe_concurrency {
            settings.discovery.probe_concurrency = n;
        }
        if let Some(n) = discovery.detect_concurrency {
            settings.detect_concurrency = n;
        }
        if let Some(n) = discovery.max_candidates_per_seed {
            settings.discovery.max_candidates_per_seed = n;
        }

        if let Some(verify) = self.detection.verify_hash {
            settings.detection.verify_hash = verify;
        }
        if let Some(days) = self.detection.verify_after_days {
            settings.detection.verify_after = Some(chrono::Duration::days(days as i64));
        }

        let retry = &self.retry;
        if let Some(ms) = retry.base_delay_ms {
            settings.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = retry.max_delay_ms {
            settings.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = retry.max_attempts {
            settings.retry.max_attempts = n.max(1);
        }
        if let Some(jitter) = retry.jitter {
            settings.retry.jitter = jitter.clamp(0.0, 1.0);
        }
        if let Some(secs) = retry.max_rate_limit_wait_secs {
            settings.retry.max_rate_limit_wait = Duration::from_secs(secs);
        }

        let circuit = &self.circuit_breaker;
        if let Some(n) = circuit.failure_threshold {
            settings.circuit.failure_threshold = n.max(1);
        }
        if let Some(secs) = circuit.failure_window_secs {
            settings.circuit.failure_window = Duration::from_secs(secs);
        }
        if let Some(secs) = circuit.cooldown_secs {
            settings.circuit.cooldown = Duration::from_secs(secs);
        }

        let rate = &self.rate_limit;
        if let Some(ms) = rate.min_delay_ms {
            settings.rate_limit.min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = rate.max_delay_ms {
            settings.rate_limit.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = rate.backoff_multiplier {
            settings.rate_limit.backoff_multiplier = m.max(1.0);
        }

        let import = &self.import;
        if let Some(n) = import.workers {
            settings.import.workers = n.max(1);
        }
        if let Some(n) = import.max_attempts {
            settings.import.max_attempts = n.max(1);
        }
        if let Some(secs) = import.lease_timeout_secs {
            settings.import.lease_timeout = chrono::Duration::seconds(secs as i64);
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory or database file (--data flag).
    /// Can be a directory containing parlsync.db or a .db file directly.
    pub data: Option<PathBuf>,
}

/// Split a `--data` argument into data directory and database filename.
fn resolve_data_path(path: &Path) -> (PathBuf, Option<String>) {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };

    let is_db_file = path
        .extension()
        .is_some_and(|ext| ext == "db" || ext == "sqlite" || ext == "sqlite3")
        || path.is_file();

    if is_db_file {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (dir, filename)
    } else {
        (path, None)
    }
}

/// Look for a config file next to the database.
fn find_config_next_to_db(data_dir: &Path) -> Option<PathBuf> {
    let extensions = ["toml", "yaml", "yml", "json"];
    let basenames = ["parlsync", "config"];

    for basename in basenames {
        for ext in extensions {
            let path = data_dir.join(format!("{}.{}", basename, ext));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

/// Load settings with explicit options.
///
/// Config priority: `--config`, then a config file inside the `--data`
/// directory, then prefer discovery. `--data` always wins for the data
/// directory itself.
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), String> {
    let data_override = options.data.as_deref().map(resolve_data_path);

    let config = if let Some(ref path) = options.config_path {
        Config::load_from_path(path).await?
    } else if let Some(path) = data_override
        .as_ref()
        .and_then(|(dir, _)| find_config_next_to_db(dir))
    {
        Config::load_from_path(&path).await?
    } else {
        Config::load().await
    };

    let mut settings = Settings::default();
    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);

    if let Some((dir, filename)) = data_override {
        settings.data_dir = dir;
        if let Some(filename) = filename {
            settings.database_filename = filename;
        }
    }

    tracing::debug!(
        "Using database {} ({} seeds)",
        settings.database_path().display(),
        settings.seeds.len()
    );
    Ok((settings, config))
}
