//! Pipeline orchestrator: discovery, change detection, queueing and import.
//!
//! A run walks `Idle → Discovering → Detecting → Queueing → Importing →
//! Reporting → Idle`, persisting each phase in `pipeline_runs`. Every run
//! first reclaims expired leases and requeues due retries, so a restarted
//! process resumes from the store alone.

mod report;

pub use report::{CleanupReport, PlannedChange, RunReport, StatusReport};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::config::{Settings, PAYLOADS_SUBDIR};
use crate::detection::ChangeDetector;
use crate::discovery::{
    Classifier, DiscoveryEngine, DiscoveryEvent, KnownFingerprints, LinkFilter, Seed,
};
use crate::error::SyncError;
use crate::import::{ImportEvent, ImportQueue, ImportService, PayloadProcessor, ResourceProcessor};
use crate::models::{
    CandidateResource, ChangeDecision, Detection, DiscoveryStatus, ProbeOutcome, ResourceRecord,
    RunCounters, RunMode, RunPhase,
};
use crate::repository::DbContext;
use crate::retry::{CircuitStats, RetryScheduler};
use crate::source::RemoteSource;

/// Failures listed by [`Pipeline::status`].
const STATUS_FAILURE_LIMIT: u32 = 50;

/// What a run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Treat every discovered resource as changed.
    pub force: bool,
    /// Persist discovery results. Only `DiscoveryOnly` runs may turn this off.
    pub save: bool,
}

impl RunOptions {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            force: false,
            save: true,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn save(mut self, save: bool) -> Self {
        self.save = save;
        self
    }

    fn persists(&self) -> bool {
        self.save || self.mode != RunMode::DiscoveryOnly
    }
}

/// Candidates collected from one discovery pass.
#[derive(Default)]
struct Discovered {
    candidates: Vec<CandidateResource>,
    completed_seeds: Vec<String>,
    failed_seeds: Vec<(String, String)>,
    cancelled: bool,
}

/// Mutable state threaded through the phases of one run.
struct RunState {
    run_id: Option<i64>,
    counters: RunCounters,
    changes: Vec<PlannedChange>,
    failed_seeds: Vec<(String, String)>,
    cancelled: bool,
}

/// Coordinates the pipeline components over one store.
pub struct Pipeline {
    db: DbContext,
    seeds: Vec<Seed>,
    data_dir: PathBuf,
    discovery: DiscoveryEngine,
    detector: ChangeDetector,
    queue: ImportQueue,
    importer: ImportService,
    scheduler: RetryScheduler,
    detect_concurrency: usize,
}

impl Pipeline {
    /// Assemble a pipeline from settings, storing payloads under the data directory.
    pub fn new(
        settings: &Settings,
        db: DbContext,
        source: Arc<dyn RemoteSource>,
    ) -> Result<Self, SyncError> {
        let processor = Arc::new(PayloadProcessor::new(&settings.data_dir));
        Self::with_processor(settings, db, source, processor)
    }

    pub fn with_processor(
        settings: &Settings,
        db: DbContext,
        source: Arc<dyn RemoteSource>,
        processor: Arc<dyn ResourceProcessor>,
    ) -> Result<Self, SyncError> {
        let scheduler = settings.retry_scheduler();
        let filter = LinkFilter::from_patterns(&settings.include, settings.extra_hosts.clone())
            .map_err(|e| SyncError::Config(format!("include pattern: {}", e)))?;
        let classifier = Classifier::new(&settings.rules)
            .map_err(|e| SyncError::Config(format!("classification rule: {}", e)))?;

        let discovery = DiscoveryEngine::new(
            source.clone(),
            scheduler.clone(),
            filter,
            classifier,
            settings.discovery.clone(),
        );
        let detector =
            ChangeDetector::new(source.clone(), scheduler.clone(), settings.detection.clone());
        let queue = ImportQueue::new(db.imports(), scheduler.clone(), &settings.import);
        let importer = ImportService::new(
            queue.clone(),
            scheduler.clone(),
            source,
            processor,
            settings.import.workers,
        );

        Ok(Self {
            db,
            seeds: settings.seeds.clone(),
            data_dir: settings.data_dir.clone(),
            discovery,
            detector,
            queue,
            importer,
            scheduler,
            detect_concurrency: settings.detect_concurrency.max(1),
        })
    }

    pub fn queue(&self) -> &ImportQueue {
        &self.queue
    }

    /// Execute one run.
    ///
    /// Per-resource failures are recorded and counted; only store errors
    /// abort the run, which is then closed with the error.
    pub async fn run(
        &self,
        options: RunOptions,
        cancel: CancelSignal,
        events: Option<mpsc::Sender<ImportEvent>>,
    ) -> Result<RunReport, SyncError> {
        let runs = self.db.runs();
        let run_id = if options.persists() {
            Some(runs.start(options.mode, options.force, Utc::now())?)
        } else {
            None
        };
        info!(
            "Starting {} run{}{}",
            options.mode.as_str(),
            if options.force { " (forced)" } else { "" },
            if run_id.is_none() { " (dry run)" } else { "" }
        );

        let mut state = RunState {
            run_id,
            counters: RunCounters::default(),
            changes: Vec::new(),
            failed_seeds: Vec::new(),
            cancelled: false,
        };

        let result = self.run_phases(&options, &mut state, cancel, events).await;

        if let Some(id) = run_id {
            let error = match &result {
                Ok(()) if state.cancelled => Some("cancelled".to_string()),
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            };
            let finished = runs
                .set_phase(id, RunPhase::Reporting)
                .and_then(|_| runs.finish(id, &state.counters, error.as_deref(), Utc::now()));
            if let Err(e) = finished {
                error!("Failed to close run {}: {}", id, e);
                if result.is_ok() {
                    return Err(e.into());
                }
            }
        }
        if let Err(e) = result {
            error!("Run aborted: {}", e);
            return Err(e);
        }

        let c = &state.counters;
        info!(
            "Run finished: {} discovered, {} new, {} changed, {} gone, {} enqueued, {} imported",
            c.discovered, c.new, c.changed, c.gone, c.enqueued, c.succeeded
        );
        let circuits = self.tripped_circuits().await;
        for (host, stats) in &circuits {
            warn!(
                "Circuit for {} tripped {} times, now {}",
                host,
                stats.trips,
                stats.state.as_str()
            );
        }
        Ok(RunReport {
            run_id,
            mode: options.mode,
            force: options.force,
            counters: state.counters,
            changes: state.changes,
            failed_seeds: state.failed_seeds,
            cancelled: state.cancelled,
            circuits,
        })
    }

    /// Hosts whose circuit has tripped since this pipeline was built, by host.
    async fn tripped_circuits(&self) -> Vec<(String, CircuitStats)> {
        let mut tripped: Vec<_> = self
            .scheduler
            .breaker()
            .stats()
            .await
            .into_iter()
            .filter(|(_, stats)| stats.trips > 0)
            .collect();
        tripped.sort_by(|a, b| a.0.cmp(&b.0));
        tripped
    }

    async fn run_phases(
        &self,
        options: &RunOptions,
        state: &mut RunState,
        mut cancel: CancelSignal,
        events: Option<mpsc::Sender<ImportEvent>>,
    ) -> Result<(), SyncError> {
        if options.persists() {
            state.counters.reclaimed = self.queue.reclaim_expired()? as u64;
            state.counters.requeued = self.queue.requeue_due()? as u64;
            if state.counters.reclaimed + state.counters.requeued > 0 {
                info!(
                    "Queue maintenance: {} expired leases reclaimed, {} retries requeued",
                    state.counters.reclaimed, state.counters.requeued
                );
            }
        }

        if options.mode.discovers() {
            self.enter(state, RunPhase::Discovering)?;
            let known: HashMap<String, ResourceRecord> = self
                .db
                .resources()
                .list(None)?
                .into_iter()
                .map(|r| (r.url.clone(), r))
                .collect();
            let discovered = self.discover(&known, &mut cancel).await;
            state.counters.discovered = discovered.candidates.len() as u64;
            state.counters.seeds_failed = discovered.failed_seeds.len() as u64;
            state.failed_seeds = discovered.failed_seeds.clone();
            if discovered.cancelled {
                state.cancelled = true;
                return Ok(());
            }

            self.enter(state, RunPhase::Detecting)?;
            let to_enqueue = self
                .detect(options, state, &known, &discovered, &mut cancel)
                .await?;
            if state.cancelled {
                return Ok(());
            }

            self.enter(state, RunPhase::Queueing)?;
            if options.persists() {
                for url in &to_enqueue {
                    if self.queue.enqueue(url)? {
                        state.counters.enqueued += 1;
                    } else {
                        debug!("{} already queued", url);
                    }
                }
            } else {
                state.counters.enqueued = to_enqueue.len() as u64;
            }
        }

        if options.mode.imports() && !cancel.is_cancelled() {
            self.enter(state, RunPhase::Importing)?;
            let summary = self.importer.run(cancel.clone(), events).await?;
            state.counters.succeeded = summary.succeeded as u64;
            state.counters.skipped = summary.skipped as u64;
            state.counters.failed = summary.failed as u64;
            state.cancelled |= summary.cancelled;
        }
        state.cancelled |= cancel.is_cancelled();
        Ok(())
    }

    fn enter(&self, state: &RunState, phase: RunPhase) -> Result<(), SyncError> {
        info!("Phase: {}", phase.as_str());
        if let Some(id) = state.run_id {
            let runs = self.db.runs();
            runs.set_phase(id, phase)?;
            runs.save_counters(id, &state.counters)?;
        }
        Ok(())
    }

    /// Drain the discovery stream, deduplicating candidates reported by several seeds.
    async fn discover(
        &self,
        known: &HashMap<String, ResourceRecord>,
        cancel: &mut CancelSignal,
    ) -> Discovered {
        let fingerprints: KnownFingerprints = known
            .iter()
            .map(|(url, record)| (url.clone(), record.fingerprint()))
            .collect();

        let mut discovered = Discovered::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut events = pin!(self.discovery.discover(&self.seeds, &fingerprints));

        loop {
            let event = match cancel.run(events.next()).await {
                None => {
                    discovered.cancelled = true;
                    break;
                }
                Some(None) => break,
                Some(Some(event)) => event,
            };
            match event {
                DiscoveryEvent::Candidate(candidate) => match index.get(&candidate.url) {
                    Some(&i) => {
                        // Keep the seed that already owns the record, so
                        // per-seed gone inference stays stable.
                        let owner = known.get(&candidate.url).map(|r| r.seed_url.as_str());
                        if owner == Some(candidate.seed_url.as_str()) {
                            discovered.candidates[i].seed_url = candidate.seed_url;
                        }
                    }
                    None => {
                        index.insert(candidate.url.clone(), discovered.candidates.len());
                        discovered.candidates.push(candidate);
                    }
                },
                DiscoveryEvent::SeedCompleted { seed, candidates } => {
                    debug!("Seed {} completed with {} candidates", seed, candidates);
                    discovered.completed_seeds.push(seed);
                }
                DiscoveryEvent::SeedFailed { seed, error } => {
                    warn!("Seed {} failed: {}", seed, error);
                    discovered.failed_seeds.push((seed, error));
                }
            }
        }
        discovered
    }

    /// Decide each candidate, persist the decisions and infer deletions.
    /// Returns the URLs to enqueue.
    async fn detect(
        &self,
        options: &RunOptions,
        state: &mut RunState,
        known: &HashMap<String, ResourceRecord>,
        discovered: &Discovered,
        cancel: &mut CancelSignal,
    ) -> Result<Vec<String>, SyncError> {
        let resources = self.db.resources();
        let persist = options.persists();
        let detector = &self.detector;
        let force = options.force;

        let mut decisions = pin!(stream::iter(discovered.candidates.iter())
            .map(|candidate| async move {
                let existing = known.get(&candidate.url);
                let detection = match &candidate.probe {
                    ProbeOutcome::Found(_) if force => {
                        Ok(ChangeDetector::forced(candidate, existing))
                    }
                    _ => detector.detect(candidate, existing, Utc::now()).await,
                };
                (candidate, existing, detection)
            })
            .buffered(self.detect_concurrency));

        let mut to_enqueue = Vec::new();
        loop {
            let (candidate, existing, detection) = match cancel.run(decisions.next()).await {
                None => {
                    state.cancelled = true;
                    return Ok(to_enqueue);
                }
                Some(None) => break,
                Some(Some(item)) => item,
            };
            let now = Utc::now();

            if candidate.metadata().is_some() && candidate.classification.is_unclassified() {
                state.counters.unclassified += 1;
            }

            let detection: Detection = match detection {
                Ok(d) => d,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Could not check {}: {}", candidate.url, e);
                    state.counters.probe_errors += 1;
                    if persist {
                        resources.record_probe_failure(candidate, &e.to_string(), now)?;
                    }
                    continue;
                }
            };

            if detection.decision == ChangeDecision::Gone
                && !existing.is_some_and(|r| r.discovery_status != DiscoveryStatus::Inactive)
            {
                // Never seen, or already inactive.
                debug!("{} is missing and not tracked as active", candidate.url);
                continue;
            }

            match detection.decision {
                ChangeDecision::New => state.counters.new += 1,
                ChangeDecision::Unchanged => state.counters.unchanged += 1,
                ChangeDecision::Changed => state.counters.changed += 1,
                ChangeDecision::Gone => state.counters.gone += 1,
            }
            if detection.decision != ChangeDecision::Unchanged {
                state.changes.push(PlannedChange {
                    url: candidate.url.clone(),
                    decision: detection.decision,
                    method: detection.method,
                });
            }
            if persist {
                resources.apply_detection(candidate, &detection, now)?;
            }
            if detection.decision.needs_import() {
                to_enqueue.push(candidate.url.clone());
            }
        }

        self.infer_gone(state, persist, discovered)?;
        Ok(to_enqueue)
    }

    /// Mark active resources of fully crawled seeds that were not reported as gone.
    fn infer_gone(
        &self,
        state: &mut RunState,
        persist: bool,
        discovered: &Discovered,
    ) -> Result<(), SyncError> {
        let resources = self.db.resources();
        let reported: HashSet<&str> = discovered
            .candidates
            .iter()
            .map(|c| c.url.as_str())
            .collect();
        let now = Utc::now();

        for url in resources.active_urls_for_seeds(&discovered.completed_seeds)? {
            if reported.contains(url.as_str()) {
                continue;
            }
            let marked = !persist || resources.mark_gone(&url, "no longer listed", now)?;
            if marked {
                info!("{} is no longer listed", url);
                state.counters.gone += 1;
                state.changes.push(PlannedChange {
                    url,
                    decision: ChangeDecision::Gone,
                    method: None,
                });
            }
        }
        Ok(())
    }

    /// Counts by state, failures and the latest run.
    pub fn status(&self) -> Result<StatusReport, SyncError> {
        let resources = self.db.resources();
        let imports = self.db.imports();
        Ok(StatusReport {
            resources: resources.count_by_status()?,
            changed: resources.count_changed()?,
            unclassified: resources.count_unclassified()?,
            imports: imports.state_counts()?,
            failures: imports.failures(STATUS_FAILURE_LIMIT)?,
            latest_run: self.db.runs().latest()?,
        })
    }

    /// Reclaim expired leases and close abandoned runs. With `full`, also
    /// delete unreferenced payload files and compact the database.
    pub async fn cleanup(&self, full: bool) -> Result<CleanupReport, SyncError> {
        let now = Utc::now();
        let mut report = CleanupReport {
            reclaimed_leases: self.queue.reclaim_expired()?,
            ..Default::default()
        };
        // A run older than one lease timeout that never finished is dead.
        let cutoff = now - self.queue.lease_timeout();
        report.closed_runs = self.db.runs().close_abandoned(cutoff, now)?;

        if full {
            let referenced: HashSet<String> =
                self.db.imports().payload_paths()?.into_iter().collect();
            report.removed_files = remove_orphans(&self.data_dir, &referenced).await;
            self.db.vacuum()?;
            report.vacuumed = true;
        }
        info!(
            "Cleanup: {} leases reclaimed, {} runs closed, {} files removed",
            report.reclaimed_leases, report.closed_runs, report.removed_files
        );
        Ok(report)
    }
}

/// Delete files under `payloads/` that no payload row references.
async fn remove_orphans(data_dir: &Path, referenced: &HashSet<String>) -> usize {
    let root = data_dir.join(PAYLOADS_SUBDIR);
    let mut removed = 0;
    let mut dirs = vec![root];

    while let Some(dir) = dirs.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                dirs.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(data_dir)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            if referenced.contains(&relative) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed orphan payload {}", relative);
                    removed += 1;
                }
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
    removed
}
