//! Import queue and worker pool.
//!
//! The queue is the `import_status` table: workers claim a lineage under a
//! lease, download and process the resource, then record the outcome.
//! Retries are durable: a failed lineage waits in the table until
//! [`ImportQueue::requeue_due`] puts it back, which happens at the start of
//! every pipeline run.

mod processor;

pub use processor::{summarize, ImportItem, PayloadFormat, PayloadProcessor, ResourceProcessor};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::error::SyncError;
use crate::models::Lease;
use crate::repository::{self, Completion, ImportRepository, NewPayload};
use crate::retry::RetryScheduler;
use crate::source::{FetchError, RemoteSource};

/// Worker pool and retry settings.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub workers: usize,
    /// Attempts before a lineage is failed permanently.
    pub max_attempts: u32,
    /// How long a claim stays exclusive without being completed.
    pub lease_timeout: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 6,
            lease_timeout: Duration::minutes(15),
        }
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be requeued once `next_retry_at` has passed.
    Retry {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Will not be retried automatically.
    Permanent { retry_count: u32 },
}

/// Queue operations with the retry schedule applied.
#[derive(Debug, Clone)]
pub struct ImportQueue {
    repo: ImportRepository,
    scheduler: RetryScheduler,
    max_attempts: u32,
    lease_timeout: Duration,
}

impl ImportQueue {
    pub fn new(repo: ImportRepository, scheduler: RetryScheduler, options: &ImportOptions) -> Self {
        Self {
            repo,
            scheduler,
            max_attempts: options.max_attempts.max(1),
            lease_timeout: options.lease_timeout,
        }
    }

    pub fn repository(&self) -> &ImportRepository {
        &self.repo
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Queue a resource. False if it is already pending or in progress.
    pub fn enqueue(&self, resource_url: &str) -> repository::Result<bool> {
        self.repo.enqueue(resource_url, Utc::now())
    }

    pub fn claim(&self, owner: &str) -> repository::Result<Option<Lease>> {
        self.repo.claim(owner, self.lease_timeout, Utc::now())
    }

    /// Record success, or `skipped` when this content was already imported.
    pub fn complete(
        &self,
        lease: &Lease,
        content_hash: &str,
        byte_size: u64,
        payload: Option<&NewPayload>,
        duration_ms: u64,
    ) -> Result<Completion, SyncError> {
        match self.repo.complete(
            lease,
            content_hash,
            byte_size,
            payload,
            duration_ms,
            Utc::now(),
        )? {
            Completion::LeaseLost => Err(SyncError::LeaseExpired {
                import_id: lease.import_id,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Record a failed attempt and schedule its retry.
    pub fn fail(
        &self,
        lease: &Lease,
        error: &SyncError,
        duration_ms: u64,
    ) -> Result<FailureOutcome, SyncError> {
        let now = Utc::now();
        let retry_count = lease.retry_count + 1;
        let permanent = error.is_permanent() || retry_count >= self.max_attempts;
        let next_retry_at = (!permanent).then(|| {
            let delay = self.scheduler.retry_delay(retry_count, error.retry_after());
            now + Duration::from_std(delay).unwrap_or(Duration::zero())
        });

        let held = self.repo.fail(
            lease,
            &error.to_string(),
            retry_count,
            next_retry_at,
            permanent,
            duration_ms,
            now,
        )?;
        if !held {
            return Err(SyncError::LeaseExpired {
                import_id: lease.import_id,
            });
        }

        Ok(match next_retry_at {
            Some(next_retry_at) => FailureOutcome::Retry {
                retry_count,
                next_retry_at,
            },
            None => FailureOutcome::Permanent { retry_count },
        })
    }

    pub fn reclaim_expired(&self) -> repository::Result<usize> {
        self.repo.reclaim_expired(self.max_attempts, Utc::now())
    }

    pub fn requeue_due(&self) -> repository::Result<usize> {
        self.repo.requeue_due(Utc::now())
    }
}

/// Events emitted by import workers for progress display.
#[derive(Debug, Clone)]
pub enum ImportEvent {
    Started {
        worker_id: usize,
        url: String,
    },
    Succeeded {
        worker_id: usize,
        url: String,
    },
    /// Content identical to an already imported version.
    Skipped {
        worker_id: usize,
        url: String,
    },
    Failed {
        worker_id: usize,
        url: String,
        error: String,
        permanent: bool,
    },
}

/// Counts from one pass of the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Leases that expired before their worker finished.
    pub lease_lost: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    lease_lost: AtomicUsize,
}

/// Shared state handed to every worker.
struct WorkerContext {
    queue: ImportQueue,
    scheduler: RetryScheduler,
    source: Arc<dyn RemoteSource>,
    processor: Arc<dyn ResourceProcessor>,
    counters: Counters,
}

/// Runs import workers until the queue is drained.
pub struct ImportService {
    ctx: Arc<WorkerContext>,
    workers: usize,
}

impl ImportService {
    pub fn new(
        queue: ImportQueue,
        scheduler: RetryScheduler,
        source: Arc<dyn RemoteSource>,
        processor: Arc<dyn ResourceProcessor>,
        workers: usize,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                queue,
                scheduler,
                source,
                processor,
                counters: Counters::default(),
            }),
            workers: workers.max(1),
        }
    }

    /// Process pending imports with the configured number of workers.
    ///
    /// Returns once the queue is empty or `cancel` fires. Only store errors
    /// are returned; per-resource failures are recorded on their lineage.
    pub async fn run(
        &self,
        cancel: CancelSignal,
        event_tx: Option<mpsc::Sender<ImportEvent>>,
    ) -> Result<ImportSummary, SyncError> {
        let run_id = uuid::Uuid::new_v4();
        let before = self.snapshot();
        let mut handles = Vec::with_capacity(self.workers);

        for worker_id in 0..self.workers {
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();
            let event_tx = event_tx.clone();
            let owner = format!("{}-{}", run_id, worker_id);
            handles.push(tokio::spawn(async move {
                worker_loop(ctx, worker_id, owner, cancel, event_tx).await
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!("Import worker task failed: {}", e),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let after = self.snapshot();
        let summary = ImportSummary {
            succeeded: after.succeeded - before.succeeded,
            skipped: after.skipped - before.skipped,
            failed: after.failed - before.failed,
            lease_lost: after.lease_lost - before.lease_lost,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            "Import pass finished: {} succeeded, {} skipped, {} failed",
            summary.succeeded, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    fn snapshot(&self) -> ImportSummary {
        let c = &self.ctx.counters;
        ImportSummary {
            succeeded: c.succeeded.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            lease_lost: c.lease_lost.load(Ordering::Relaxed),
            cancelled: false,
        }
    }
}

async fn emit(event_tx: &Option<mpsc::Sender<ImportEvent>>, event: ImportEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event).await;
    }
}

async fn worker_loop(
    ctx: Arc<WorkerContext>,
    worker_id: usize,
    owner: String,
    mut cancel: CancelSignal,
    event_tx: Option<mpsc::Sender<ImportEvent>>,
) -> Result<(), SyncError> {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(lease) = ctx.queue.claim(&owner)? else {
            debug!("Worker {} found no pending imports", worker_id);
            break;
        };
        let url = lease.resource_url.clone();
        emit(
            &event_tx,
            ImportEvent::Started {
                worker_id,
                url: url.clone(),
            },
        )
        .await;

        let started = Instant::now();
        // A cancelled import keeps its lease; reclaiming it once expired
        // counts the attempt as failed.
        let Some(result) = cancel.run(import_one(&ctx, &lease, started)).await else {
            debug!("Worker {} interrupted on {}", worker_id, url);
            break;
        };

        match result {
            Ok(Completion::Succeeded) => {
                ctx.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                emit(&event_tx, ImportEvent::Succeeded { worker_id, url }).await;
            }
            Ok(_) => {
                ctx.counters.skipped.fetch_add(1, Ordering::Relaxed);
                emit(&event_tx, ImportEvent::Skipped { worker_id, url }).await;
            }
            Err(SyncError::LeaseExpired { import_id }) => {
                warn!("Lease on import {} ({}) expired mid-flight", import_id, url);
                ctx.counters.lease_lost.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                match ctx.queue.fail(&lease, &e, duration_ms) {
                    Ok(outcome) => {
                        let permanent = matches!(outcome, FailureOutcome::Permanent { .. });
                        warn!(
                            "Import of {} failed{}: {}",
                            url,
                            if permanent { " permanently" } else { "" },
                            e
                        );
                        ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                        emit(
                            &event_tx,
                            ImportEvent::Failed {
                                worker_id,
                                url,
                                error: e.to_string(),
                                permanent,
                            },
                        )
                        .await;
                    }
                    Err(SyncError::LeaseExpired { .. }) => {
                        ctx.counters.lease_lost.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(())
}

/// Download, deduplicate by hash, process and record one lineage.
async fn import_one(
    ctx: &WorkerContext,
    lease: &Lease,
    started: Instant,
) -> Result<Completion, SyncError> {
    let url = lease.resource_url.as_str();
    let content = ctx
        .scheduler
        .guard(url, || ctx.source.fetch_content(url), FetchError::classify)
        .await?;

    let hash = content.content_hash();
    let size = content.bytes.len() as u64;

    let payload = if ctx.queue.repository().has_succeeded(url, &hash)? {
        debug!("{} unchanged since its last import", url);
        None
    } else {
        let item = ImportItem {
            url,
            content_hash: &hash,
            content: &content,
        };
        Some(ctx.processor.process(item).await?)
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    ctx.queue
        .complete(lease, &hash, size, payload.as_ref(), duration_ms)
}
