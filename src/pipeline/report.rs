//! Reports returned by the orchestrator entry points.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{
    ChangeDecision, ChangeMethod, DiscoveryStatus, ImportState, PipelineRun, RunCounters, RunMode,
};
use crate::repository::{FailureRecord, StateCounts};
use crate::retry::CircuitStats;

/// A decision taken (or, in a dry run, that would be taken) for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub url: String,
    pub decision: ChangeDecision,
    pub method: Option<ChangeMethod>,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// `None` for dry runs, which persist nothing.
    pub run_id: Option<i64>,
    pub mode: RunMode,
    pub force: bool,
    pub counters: RunCounters,
    /// New, changed and gone resources, in discovery order.
    pub changes: Vec<PlannedChange>,
    /// Seeds whose listing could not be fetched, with the error.
    pub failed_seeds: Vec<(String, String)>,
    pub cancelled: bool,
    /// Hosts whose circuit breaker tripped, with their current state.
    pub circuits: Vec<(String, CircuitStats)>,
}

impl RunReport {
    pub fn is_dry_run(&self) -> bool {
        self.run_id.is_none()
    }
}

/// Snapshot of the persisted pipeline state.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub resources: HashMap<DiscoveryStatus, u64>,
    /// Resources changed since their last import.
    pub changed: u64,
    pub unclassified: u64,
    pub imports: StateCounts,
    /// Linked lineages in `failed`, permanent ones first.
    pub failures: Vec<FailureRecord>,
    pub latest_run: Option<PipelineRun>,
}

impl StatusReport {
    pub fn resources(&self, status: DiscoveryStatus) -> u64 {
        self.resources.get(&status).copied().unwrap_or(0)
    }

    pub fn total_resources(&self) -> u64 {
        self.resources.values().sum()
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| f.permanent)
    }

    pub fn waiting_for_retry(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| !f.permanent)
    }

    /// Lineages still pending or in progress.
    pub fn queued(&self) -> u64 {
        self.imports.all(ImportState::Pending) + self.imports.all(ImportState::InProgress)
    }
}

/// What `cleanup` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub reclaimed_leases: usize,
    pub closed_runs: usize,
    pub removed_files: usize,
    pub vacuumed: bool,
}
