//! Pipeline run bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which parts of the pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    DiscoveryOnly,
    ImportOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::DiscoveryOnly => "discovery_only",
            Self::ImportOnly => "import_only",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "discovery_only" => Some(Self::DiscoveryOnly),
            "import_only" => Some(Self::ImportOnly),
            _ => None,
        }
    }

    pub fn discovers(&self) -> bool {
        matches!(self, Self::Full | Self::DiscoveryOnly)
    }

    pub fn imports(&self) -> bool {
        matches!(self, Self::Full | Self::ImportOnly)
    }
}

/// Orchestrator state machine: `Idle → Discovering → Detecting → Queueing → Importing → Reporting → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Discovering,
    Detecting,
    Queueing,
    Importing,
    Reporting,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Detecting => "detecting",
            Self::Queueing => "queueing",
            Self::Importing => "importing",
            Self::Reporting => "reporting",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "discovering" => Some(Self::Discovering),
            "detecting" => Some(Self::Detecting),
            "queueing" => Some(Self::Queueing),
            "importing" => Some(Self::Importing),
            "reporting" => Some(Self::Reporting),
            _ => None,
        }
    }
}

/// Counters aggregated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub discovered: u64,
    pub new: u64,
    pub unchanged: u64,
    pub changed: u64,
    pub gone: u64,
    pub unclassified: u64,
    pub probe_errors: u64,
    pub seeds_failed: u64,
    pub enqueued: u64,
    pub requeued: u64,
    pub reclaimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Persisted record of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub mode: RunMode,
    pub force: bool,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub error: Option<String>,
}

impl PipelineRun {
    /// Started but never reached `Idle` again (process died or run failed).
    pub fn is_interrupted(&self) -> bool {
        self.finished_at.is_none()
    }
}
