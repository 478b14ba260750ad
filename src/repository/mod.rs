//! Repository layer for the pipeline's persisted state.
//!
//! SQLite via rusqlite. Every repository method opens its own connection, so
//! repositories are cheap to clone and safe to share across worker tasks.
//! Cross-process coordination relies on `BEGIN IMMEDIATE` transactions and
//! the busy timeout set in [`connect`].

mod helpers;
pub mod import;
pub mod resource;
pub mod run;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

pub use import::{Completion, FailureRecord, ImportRepository, NewPayload, StateCounts};
pub use resource::ResourceRepository;
pub use run::RunRepository;

/// Errors raised by the persistence layer. Any of these is run-fatal.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a connection with WAL journaling and foreign keys enabled.
pub(crate) fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Format a timestamp for storage. Fixed width so SQL string comparison orders correctly.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Handle on the pipeline database that hands out repositories.
#[derive(Debug, Clone)]
pub struct DbContext {
    db_path: PathBuf,
}

impl DbContext {
    /// Open (and create if needed) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| RepositoryError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let ctx = Self {
            db_path: db_path.to_path_buf(),
        };
        // Resources first: import_status references resources(url).
        ResourceRepository::new(db_path)?;
        ImportRepository::new(db_path)?;
        RunRepository::new(db_path)?;
        Ok(ctx)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn resources(&self) -> ResourceRepository {
        ResourceRepository::attach(&self.db_path)
    }

    pub fn imports(&self) -> ImportRepository {
        ImportRepository::attach(&self.db_path)
    }

    pub fn runs(&self) -> RunRepository {
        RunRepository::attach(&self.db_path)
    }

    /// Reclaim free pages after large deletions.
    pub fn vacuum(&self) -> Result<()> {
        let conn = connect(&self.db_path)?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}
