//! Pipeline run history.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::helpers::row_to_run;
use super::{connect, format_datetime, Result};
use crate::models::{PipelineRun, RunCounters, RunMode, RunPhase};

/// SQLite-backed repository for pipeline runs.
#[derive(Debug, Clone)]
pub struct RunRepository {
    db_path: PathBuf,
}

impl RunRepository {
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
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                force INTEGER NOT NULL DEFAULT 0,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                counters TEXT NOT NULL DEFAULT '{}',
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_started ON pipeline_runs(started_at);
        "#,
        )?;
        Ok(())
    }

    /// Record the start of a run and return its id.
    pub fn start(&self, mode: RunMode, force: bool, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO pipeline_runs (mode, force, phase, started_at, counters)
            VALUES (?, ?, 'idle', ?, '{}')
            "#,
            params![mode.as_str(), force as i32, format_datetime(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_phase(&self, id: i64, phase: RunPhase) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_runs SET phase = ? WHERE id = ?",
            params![phase.as_str(), id],
        )?;
        Ok(())
    }

    /// Save intermediate counters so an interrupted run still shows progress.
    pub fn save_counters(&self, id: i64, counters: &RunCounters) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_runs SET counters = ? WHERE id = ?",
            params![serde_json::to_string(counters)?, id],
        )?;
        Ok(())
    }

    /// Mark a run finished, returning it to `idle`.
    pub fn finish(
        &self,
        id: i64,
        counters: &RunCounters,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE pipeline_runs SET
                phase = 'idle',
                counters = ?2,
                error = ?3,
                finished_at = ?4
            WHERE id = ?1
            "#,
            params![
                id,
                serde_json::to_string(counters)?,
                error,
                format_datetime(now)
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<PipelineRun>> {
        let conn = self.connect()?;
        let run = conn
            .query_row(
                "SELECT * FROM pipeline_runs WHERE id = ?",
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<PipelineRun>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM pipeline_runs ORDER BY started_at DESC, id DESC LIMIT ?")?;
        let runs = stmt
            .query_map(params![limit], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn latest(&self) -> Result<Option<PipelineRun>> {
        Ok(self.recent(1)?.into_iter().next())
    }

    /// Close runs that were never finished and started before `before`.
    pub fn close_abandoned(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let closed = conn.execute(
            r#"
            UPDATE pipeline_runs SET
                error = COALESCE(error, 'interrupted in phase ' || phase),
                phase = 'idle',
                finished_at = ?2
            WHERE finished_at IS NULL AND started_at < ?1
            "#,
            params![format_datetime(before), format_datetime(now)],
        )?;
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, RunRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = RunRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_run_lifecycle() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        let id = repo.start(RunMode::Full, false, now).unwrap();
        repo.set_phase(id, RunPhase::Importing).unwrap();

        let run = repo.get(id).unwrap().unwrap();
        assert_eq!(run.phase, RunPhase::Importing);
        assert!(run.is_interrupted());

        let counters = RunCounters {
            discovered: 3,
            succeeded: 2,
            ..Default::default()
        };
        repo.finish(id, &counters, None, now).unwrap();

        let run = repo.latest().unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.phase, RunPhase::Idle);
        assert_eq!(run.counters, counters);
        assert!(!run.is_interrupted());
    }

    #[test]
    fn test_close_abandoned_records_phase() {
        let (_dir, repo) = repo();
        let start = Utc::now() - chrono::Duration::hours(2);
        let id = repo.start(RunMode::ImportOnly, false, start).unwrap();
        repo.set_phase(id, RunPhase::Importing).unwrap();

        assert_eq!(repo.close_abandoned(Utc::now(), Utc::now()).unwrap(), 1);
        let run = repo.get(id).unwrap().unwrap();
        assert_eq!(run.error.as_deref(), Some("interrupted in phase importing"));
    }
}
