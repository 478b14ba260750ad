//! Durable import queue.
//!
//! `import_status` holds one row per processing lineage. A lineage is reused
//! across retries: failures move it to `failed`, and once its retry time is
//! due it goes back to `pending`. Processed payloads land in
//! `resource_payloads`, written in the same transaction that marks the
//! lineage succeeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::helpers::row_to_import_status;
use super::{connect, format_datetime, parse_datetime_opt, Result};
use crate::models::{ImportState, ImportStatus, Lease};

/// Processed output of one import, ready to be recorded.
#[derive(Debug, Clone)]
pub struct NewPayload {
    pub content_type: String,
    /// Location of the stored payload, relative to the data directory.
    pub storage_path: String,
    /// Processor-specific summary of the payload.
    pub summary: serde_json::Value,
}

/// What happened when a worker tried to record success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    /// This content hash had already been imported for the resource.
    Skipped,
    /// The lease expired and was reclaimed before the worker finished.
    LeaseLost,
}

/// A failed lineage, joined with the resource's classification.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub import_id: i64,
    pub resource_url: String,
    pub section_name: String,
    pub retry_count: u32,
    pub permanent: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Lineage counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Every lineage ever recorded.
    pub all: HashMap<ImportState, u64>,
    /// Only the lineages currently linked from a resource.
    pub current: HashMap<ImportState, u64>,
}

impl StateCounts {
    pub fn all(&self, state: ImportState) -> u64 {
        self.all.get(&state).copied().unwrap_or(0)
    }

    pub fn current(&self, state: ImportState) -> u64 {
        self.current.get(&state).copied().unwrap_or(0)
    }
}

/// SQLite-backed repository for import lineages and payloads.
#[derive(Debug, Clone)]
pub struct ImportRepository {
    db_path: PathBuf,
}

impl ImportRepository {
    /// Create the repository, initializing its schema.
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self::attach(db_path);
        repo.init_schema()?;
        Ok(repo)
    }

    /// Attach to a database whose schema is already initialized.
    pub(crate) fn attach(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS import_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_url TEXT NOT NULL REFERENCES resources(url),
                content_hash TEXT,
                state TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                last_error TEXT,
                processing_duration_ms INTEGER,
                permanent INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            -- A given content version is imported at most once.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_import_succeeded_hash
                ON import_status(resource_url, content_hash) WHERE state = 'succeeded';
            -- At most one unresolved lineage per resource.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_import_unresolved
                ON import_status(resource_url) WHERE state IN ('pending', 'in_progress');
            CREATE INDEX IF NOT EXISTS idx_import_state
                ON import_status(state, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_import_lease
                ON import_status(state, lease_expires_at);
            CREATE INDEX IF NOT EXISTS idx_import_url
                ON import_status(resource_url);

            CREATE TABLE IF NOT EXISTS resource_payloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_url TEXT NOT NULL REFERENCES resources(url),
                import_status_id INTEGER NOT NULL REFERENCES import_status(id),
                content_hash TEXT NOT NULL,
                content_type TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                storage_path TEXT NOT NULL,
                summary TEXT NOT NULL,
                imported_at TEXT NOT NULL,
                UNIQUE(resource_url, content_hash)
            );
        "#,
        )?;
        Ok(())
    }

    /// Queue a resource for import.
    ///
    /// Returns false (and changes nothing) if an unresolved lineage already
    /// exists for the resource.
    pub fn enqueue(&self, resource_url: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
            .query_row(
                r#"
                SELECT id FROM import_status
                WHERE resource_url = ? AND state IN ('pending', 'in_progress')
                "#,
                params![resource_url],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }

        let now_str = format_datetime(now);
        tx.execute(
            r#"
            INSERT INTO import_status (resource_url, state, retry_count, permanent, created_at)
            VALUES (?, 'pending', 0, 0, ?)
            "#,
            params![resource_url, now_str],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE resources SET linked_import_status_id = ? WHERE url = ?",
            params![id, resource_url],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Atomically claim the oldest due pending lineage.
    pub fn claim(
        &self,
        owner: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_str = format_datetime(now);

        let candidate: Option<(i64, String, i64)> = tx
            .query_row(
                r#"
                SELECT id, resource_url, retry_count FROM import_status
                WHERE state = 'pending'
                AND (next_retry_at IS NULL OR next_retry_at <= ?)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                "#,
                params![now_str],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((import_id, resource_url, retry_count)) = candidate else {
            return Ok(None);
        };

        let expires_at = now + lease_timeout;
        tx.execute(
            r#"
            UPDATE import_status SET
                state = 'in_progress',
                lease_owner = ?2,
                lease_expires_at = ?3,
                started_at = ?4,
                finished_at = NULL
            WHERE id = ?1 AND state = 'pending'
            "#,
            params![import_id, owner, format_datetime(expires_at), now_str],
        )?;
        tx.commit()?;

        Ok(Some(Lease {
            import_id,
            resource_url,
            owner: owner.to_string(),
            expires_at,
            retry_count: retry_count as u32,
        }))
    }

    /// Whether this exact content version was already imported for the resource.
    pub fn has_succeeded(&self, resource_url: &str, content_hash: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM import_status
            WHERE resource_url = ? AND content_hash = ? AND state = 'succeeded'
            "#,
            params![resource_url, content_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a finished import.
    ///
    /// With `payload = None`, or when the hash was already imported, the
    /// lineage ends as `skipped`. Either way the resource's fingerprint takes
    /// the downloaded hash and its change flag is cleared, unless a newer
    /// lineage has been linked meanwhile.
    pub fn complete(
        &self,
        lease: &Lease,
        content_hash: &str,
        byte_size: u64,
        payload: Option<&NewPayload>,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Completion> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !Self::lease_held(&tx, lease)? {
            return Ok(Completion::LeaseLost);
        }

        let already_imported: i64 = tx.query_row(
            r#"
            SELECT COUNT(*) FROM import_status
            WHERE resource_url = ? AND content_hash = ? AND state = 'succeeded' AND id != ?
            "#,
            params![lease.resource_url, content_hash, lease.import_id],
            |row| row.get(0),
        )?;

        let now_str = format_datetime(now);
        let outcome = match payload {
            Some(payload) if already_imported == 0 => {
                tx.execute(
                    r#"
                    INSERT OR IGNORE INTO resource_payloads (
                        resource_url, import_status_id, content_hash, content_type,
                        byte_size, storage_path, summary, imported_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        lease.resource_url,
                        lease.import_id,
                        content_hash,
                        payload.content_type,
                        byte_size as i64,
                        payload.storage_path,
                        serde_json::to_string(&payload.summary)?,
                        now_str,
                    ],
                )?;
                Completion::Succeeded
            }
            _ => Completion::Skipped,
        };
        let state = match outcome {
            Completion::Succeeded => ImportState::Succeeded,
            _ => ImportState::Skipped,
        };

        tx.execute(
            r#"
            UPDATE import_status SET
                state = ?2,
                content_hash = ?3,
                processing_duration_ms = ?4,
                finished_at = ?5,
                last_error = NULL,
                next_retry_at = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = ?1
            "#,
            params![
                lease.import_id,
                state.as_str(),
                content_hash,
                duration_ms as i64,
                now_str
            ],
        )?;

        tx.execute(
            r#"
            UPDATE resources SET
                current_content_hash = ?3,
                current_size = ?4,
                hash_verified_at = ?5,
                changed_since_last_import = 0
            WHERE url = ?1 AND linked_import_status_id = ?2
            "#,
            params![
                lease.resource_url,
                lease.import_id,
                content_hash,
                byte_size as i64,
                now_str
            ],
        )?;

        tx.commit()?;
        Ok(outcome)
    }

    /// Record a failed attempt. Returns false if the lease had been lost.
    #[allow(clippy::too_many_arguments)]
    pub fn fail(
        &self,
        lease: &Lease,
        error: &str,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        permanent: bool,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !Self::lease_held(&tx, lease)? {
            return Ok(false);
        }

        tx.execute(
            r#"
            UPDATE import_status SET
                state = 'failed',
                retry_count = ?2,
                next_retry_at = ?3,
                permanent = ?4,
                last_error = ?5,
                processing_duration_ms = ?6,
                finished_at = ?7,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = ?1
            "#,
            params![
                lease.import_id,
                retry_count as i64,
                next_retry_at.map(format_datetime),
                permanent as i32,
                error,
                duration_ms as i64,
                format_datetime(now),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn lease_held(conn: &Connection, lease: &Lease) -> Result<bool> {
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT state, lease_owner FROM import_status WHERE id = ?",
                params![lease.import_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(matches!(
            row,
            Some((state, Some(owner)))
                if state == ImportState::InProgress.as_str() && owner == lease.owner
        ))
    }

    /// Fail every in-progress lineage whose lease has expired.
    ///
    /// Each reclaimed lineage counts as one failed attempt and is due for
    /// retry immediately, unless that attempt exhausts `max_attempts`.
    pub fn reclaim_expired(&self, max_attempts: u32, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let now_str = format_datetime(now);
        let reclaimed = conn.execute(
            r#"
            UPDATE import_status SET
                state = 'failed',
                retry_count = retry_count + 1,
                permanent = CASE WHEN retry_count + 1 >= ?2 THEN 1 ELSE 0 END,
                next_retry_at = ?1,
                last_error = 'lease expired before the worker finished',
                finished_at = ?1,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE state = 'in_progress' AND lease_expires_at <= ?1
            "#,
            params![now_str, max_attempts as i64],
        )?;
        Ok(reclaimed)
    }

    /// Move due, retryable failures back to `pending`.
    ///
    /// Only the lineage currently linked from a resource is retried; older
    /// lineages were superseded by a newer change. Resources that are no
    /// longer published are left alone.
    pub fn requeue_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let requeued = conn.execute(
            r#"
            UPDATE import_status SET
                state = 'pending',
                started_at = NULL,
                finished_at = NULL
            WHERE state = 'failed'
            AND permanent = 0
            AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            AND id IN (
                SELECT linked_import_status_id FROM resources
                WHERE linked_import_status_id IS NOT NULL
                AND discovery_status != 'inactive'
            )
            AND NOT EXISTS (
                SELECT 1 FROM import_status other
                WHERE other.resource_url = import_status.resource_url
                AND other.state IN ('pending', 'in_progress')
            )
            "#,
            params![format_datetime(now)],
        )?;
        Ok(requeued)
    }

    /// Get a lineage by id.
    pub fn get(&self, id: i64) -> Result<Option<ImportStatus>> {
        let conn = self.connect()?;
        let status = conn
            .query_row(
                "SELECT * FROM import_status WHERE id = ?",
                params![id],
                row_to_import_status,
            )
            .optional()?;
        Ok(status)
    }

    /// Every lineage recorded for a resource, oldest first.
    pub fn history(&self, resource_url: &str) -> Result<Vec<ImportStatus>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM import_status WHERE resource_url = ? ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![resource_url], row_to_import_status)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count lineages per state, overall and for the currently linked ones.
    pub fn state_counts(&self) -> Result<StateCounts> {
        let conn = self.connect()?;
        let mut counts = StateCounts::default();

        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM import_status GROUP BY state")?;
        collect_counts(&mut stmt, &mut counts.all)?;

        let mut stmt = conn.prepare(
            r#"
            SELECT i.state, COUNT(*) FROM import_status i
            JOIN resources r ON r.linked_import_status_id = i.id
            GROUP BY i.state
            "#,
        )?;
        collect_counts(&mut stmt, &mut counts.current)?;

        Ok(counts)
    }

    /// Linked lineages that failed, permanent ones first.
    pub fn failures(&self, limit: u32) -> Result<Vec<FailureRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT i.id, i.resource_url, r.section_name, i.retry_count, i.permanent,
                   i.next_retry_at, i.last_error
            FROM import_status i
            JOIN resources r ON r.linked_import_status_id = i.id
            WHERE i.state = 'failed'
            ORDER BY i.permanent DESC, i.next_retry_at ASC, i.id ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(FailureRecord {
                    import_id: row.get(0)?,
                    resource_url: row.get(1)?,
                    section_name: row.get(2)?,
                    retry_count: row.get::<_, i64>(3)? as u32,
                    permanent: row.get::<_, i32>(4)? != 0,
                    next_retry_at: parse_datetime_opt(row.get(5)?),
                    last_error: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of lineages waiting to be claimed.
    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM import_status WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Content hashes stored for a resource, oldest first.
    pub fn payload_hashes(&self, resource_url: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT content_hash FROM resource_payloads WHERE resource_url = ? ORDER BY id",
        )?;
        let hashes = stmt
            .query_map(params![resource_url], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(hashes)
    }

    /// Storage paths referenced by any payload row.
    pub fn payload_paths(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT storage_path FROM resource_payloads")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }
}

fn collect_counts(
    stmt: &mut rusqlite::Statement<'_>,
    into: &mut HashMap<ImportState, u64>,
) -> Result<()> {
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    for row in rows {
        let (state, count) = row?;
        if let Some(state) = ImportState::from_str(&state) {
            into.insert(state, count);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CandidateResource, ChangeDecision, Classification, Detection, Fingerprint, ProbeOutcome,
        RemoteMetadata,
    };
    use crate::repository::{DbContext, ResourceRepository};

    const URL: &str = "https://dati.example.org/deputati.xml";

    fn setup() -> (tempfile::TempDir, ResourceRepository, ImportRepository) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = DbContext::open(&dir.path().join("test.db")).unwrap();
        let resources = ctx.resources();
        let candidate = CandidateResource {
            url: URL.to_string(),
            seed_url: "https://dati.example.org/".to_string(),
            classification: Classification::unclassified("application/xml"),
            probe: ProbeOutcome::Found(RemoteMetadata {
                status: 200,
                ..Default::default()
            }),
        };
        let detection = Detection {
            decision: ChangeDecision::New,
            fingerprint: Fingerprint::default(),
            method: None,
            hash_verified: false,
        };
        resources
            .apply_detection(&candidate, &detection, Utc::now())
            .unwrap();
        (dir, resources, ctx.imports())
    }

    fn payload() -> NewPayload {
        NewPayload {
            content_type: "application/xml".to_string(),
            storage_path: "payloads/ab/abc.xml".to_string(),
            summary: serde_json::json!({"root": "deputati"}),
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let (_dir, resources, imports) = setup();
        let now = Utc::now();
        assert!(imports.enqueue(URL, now).unwrap());
        assert!(!imports.enqueue(URL, now).unwrap());

        let history = imports.history(URL).unwrap();
        assert_eq!(history.len(), 1);
        let record = resources.get(URL).unwrap().unwrap();
        assert_eq!(record.linked_import_status_id, Some(history[0].id));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (_dir, _resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();

        let lease = imports.claim("w1", Duration::minutes(15), now).unwrap();
        assert!(lease.is_some());
        assert!(imports
            .claim("w2", Duration::minutes(15), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_complete_clears_change_flag() {
        let (_dir, resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::minutes(15), now)
            .unwrap()
            .unwrap();

        let outcome = imports
            .complete(&lease, "abc", 3, Some(&payload()), 12, now)
            .unwrap();
        assert_eq!(outcome, Completion::Succeeded);

        let record = resources.get(URL).unwrap().unwrap();
        assert!(!record.changed_since_last_import);
        assert_eq!(record.trusted_hash(), Some("abc"));
        assert_eq!(imports.payload_hashes(URL).unwrap(), vec!["abc".to_string()]);
    }

    #[test]
    fn test_same_hash_is_skipped() {
        let (_dir, _resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::minutes(15), now)
            .unwrap()
            .unwrap();
        imports
            .complete(&lease, "abc", 3, Some(&payload()), 12, now)
            .unwrap();

        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::minutes(15), now)
            .unwrap()
            .unwrap();
        let outcome = imports
            .complete(&lease, "abc", 3, Some(&payload()), 5, now)
            .unwrap();
        assert_eq!(outcome, Completion::Skipped);

        let states: Vec<_> = imports
            .history(URL)
            .unwrap()
            .into_iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(states, vec![ImportState::Succeeded, ImportState::Skipped]);
        assert_eq!(imports.payload_hashes(URL).unwrap().len(), 1);
    }

    #[test]
    fn test_expired_lease_is_reclaimed_and_requeued() {
        let (_dir, _resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::seconds(10), now)
            .unwrap()
            .unwrap();

        let later = now + Duration::seconds(11);
        assert_eq!(imports.reclaim_expired(6, later).unwrap(), 1);
        assert_eq!(imports.requeue_due(later).unwrap(), 1);

        // The original worker lost its lease.
        let outcome = imports
            .complete(&lease, "abc", 3, Some(&payload()), 1, later)
            .unwrap();
        assert_eq!(outcome, Completion::LeaseLost);

        let lease = imports
            .claim("w2", Duration::seconds(10), later)
            .unwrap()
            .unwrap();
        assert_eq!(lease.retry_count, 1);
    }

    #[test]
    fn test_permanent_failure_is_not_requeued() {
        let (_dir, _resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::minutes(15), now)
            .unwrap()
            .unwrap();
        assert!(imports
            .fail(&lease, "not XML", 1, None, true, 3, now)
            .unwrap());

        assert_eq!(imports.requeue_due(now + Duration::hours(1)).unwrap(), 0);
        let failures = imports.failures(10).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].permanent);
        assert_eq!(failures[0].last_error.as_deref(), Some("not XML"));
    }

    #[test]
    fn test_state_counts_track_linked_lineage() {
        let (_dir, _resources, imports) = setup();
        let now = Utc::now();
        imports.enqueue(URL, now).unwrap();
        let lease = imports
            .claim("w1", Duration::minutes(15), now)
            .unwrap()
            .unwrap();
        imports
            .fail(&lease, "timeout", 1, Some(now), false, 3, now)
            .unwrap();

        let counts = imports.state_counts().unwrap();
        assert_eq!(counts.all(ImportState::Failed), 1);
        assert_eq!(counts.current(ImportState::Failed), 1);
        assert_eq!(counts.current(ImportState::Pending), 0);
    }
}
