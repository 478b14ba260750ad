//! Fingerprint store: one row per discovered remote resource.
//!
//! Rows are never deleted. A resource that disappears from the source is
//! marked `inactive` so the deletion stays auditable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::helpers::row_to_resource;
use super::{connect, format_datetime, Result};
use crate::models::{
    CandidateResource, ChangeDecision, Detection, DiscoveryStatus, ResourceRecord,
};

/// SQLite-backed repository for resource records.
#[derive(Debug, Clone)]
pub struct ResourceRepository {
    db_path: PathBuf,
}

impl ResourceRepository {
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
            CREATE TABLE IF NOT EXISTS resources (
                url TEXT PRIMARY KEY,
                seed_url TEXT NOT NULL,

                -- Classification
                section_name TEXT NOT NULL,
                data_type TEXT NOT NULL,
                legislature_tag TEXT NOT NULL,
                content_type TEXT NOT NULL,

                -- Discovery lifecycle
                first_discovered_at TEXT NOT NULL,
                last_checked_at TEXT NOT NULL,
                discovery_status TEXT NOT NULL DEFAULT 'active',
                last_error TEXT,

                -- Fingerprint
                current_etag TEXT,
                current_last_modified TEXT,
                current_content_hash TEXT,
                current_size INTEGER,
                hash_verified_at TEXT,

                -- Change tracking
                changed_since_last_import INTEGER NOT NULL DEFAULT 0,
                last_change_at TEXT,
                change_detection_method TEXT,

                -- Most recent import lineage (import_status.id)
                linked_import_status_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_resources_status
                ON resources(discovery_status);
            CREATE INDEX IF NOT EXISTS idx_resources_seed
                ON resources(seed_url, discovery_status);
            CREATE INDEX IF NOT EXISTS idx_resources_changed
                ON resources(changed_since_last_import);
            CREATE INDEX IF NOT EXISTS idx_resources_section
                ON resources(section_name, data_type);
            CREATE INDEX IF NOT EXISTS idx_resources_linked_import
                ON resources(linked_import_status_id);
        "#,
        )?;
        Ok(())
    }

    /// Get a resource by its normalized URL.
    pub fn get(&self, url: &str) -> Result<Option<ResourceRecord>> {
        let conn = self.connect()?;
        Self::get_with(&conn, url)
    }

    fn get_with(conn: &Connection, url: &str) -> Result<Option<ResourceRecord>> {
        let record = conn
            .query_row(
                "SELECT * FROM resources WHERE url = ?",
                params![url],
                row_to_resource,
            )
            .optional()?;
        Ok(record)
    }

    /// List resources, optionally restricted to one discovery status.
    pub fn list(&self, status: Option<DiscoveryStatus>) -> Result<Vec<ResourceRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM resources
            WHERE (?1 IS NULL OR discovery_status = ?1)
            ORDER BY section_name, url
        "#,
        )?;

        let records = stmt
            .query_map(params![status.map(|s| s.as_str())], row_to_resource)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Persist the outcome of a change detection and return the updated record.
    ///
    /// Unchanged resources only advance `last_checked_at` (and refresh header
    /// values the source still reports); change flags are left untouched.
    pub fn apply_detection(
        &self,
        candidate: &CandidateResource,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Result<ResourceRecord> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now_str = format_datetime(now);
        let class = &candidate.classification;
        let fp = &detection.fingerprint;
        let verified_at = detection.hash_verified.then(|| now_str.clone());

        match detection.decision {
            ChangeDecision::New | ChangeDecision::Changed => {
                tx.execute(
                    r#"
                    INSERT INTO resources (
                        url, seed_url, section_name, data_type, legislature_tag, content_type,
                        first_discovered_at, last_checked_at, discovery_status,
                        current_etag, current_last_modified, current_content_hash, current_size,
                        hash_verified_at, changed_since_last_import, last_change_at,
                        change_detection_method
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 'active', ?8, ?9, ?10, ?11, ?12, 1, ?7, ?13)
                    ON CONFLICT(url) DO UPDATE SET
                        seed_url = excluded.seed_url,
                        section_name = excluded.section_name,
                        data_type = excluded.data_type,
                        legislature_tag = excluded.legislature_tag,
                        content_type = excluded.content_type,
                        last_checked_at = excluded.last_checked_at,
                        discovery_status = 'active',
                        last_error = NULL,
                        current_etag = excluded.current_etag,
                        current_last_modified = excluded.current_last_modified,
                        current_content_hash = excluded.current_content_hash,
                        current_size = excluded.current_size,
                        hash_verified_at = excluded.hash_verified_at,
                        changed_since_last_import = 1,
                        last_change_at = excluded.last_change_at,
                        change_detection_method = excluded.change_detection_method
                    "#,
                    params![
                        candidate.url,
                        candidate.seed_url,
                        class.section_name,
                        class.data_type,
                        class.legislature_tag,
                        class.content_type,
                        now_str,
                        fp.etag,
                        fp.last_modified,
                        fp.content_hash,
                        fp.size.map(|s| s as i64),
                        verified_at,
                        detection.method.map(|m| m.as_str()),
                    ],
                )?;
            }
            ChangeDecision::Unchanged => {
                tx.execute(
                    r#"
                    UPDATE resources SET
                        seed_url = ?2,
                        section_name = ?3,
                        data_type = ?4,
                        legislature_tag = ?5,
                        content_type = ?6,
                        last_checked_at = ?7,
                        discovery_status = 'active',
                        last_error = NULL,
                        current_etag = COALESCE(?8, current_etag),
                        current_last_modified = COALESCE(?9, current_last_modified),
                        current_content_hash = COALESCE(?10, current_content_hash),
                        current_size = COALESCE(?11, current_size),
                        hash_verified_at = COALESCE(?12, hash_verified_at)
                    WHERE url = ?1
                    "#,
                    params![
                        candidate.url,
                        candidate.seed_url,
                        class.section_name,
                        class.data_type,
                        class.legislature_tag,
                        class.content_type,
                        now_str,
                        fp.etag,
                        fp.last_modified,
                        fp.content_hash,
                        fp.size.map(|s| s as i64),
                        verified_at,
                    ],
                )?;
            }
            ChangeDecision::Gone => {
                let status = candidate_missing_status(candidate);
                tx.execute(
                    r#"
                    UPDATE resources SET
                        discovery_status = 'inactive',
                        last_checked_at = ?2,
                        last_error = ?3
                    WHERE url = ?1
                    "#,
                    params![candidate.url, now_str, status],
                )?;
            }
        }

        let record = Self::get_with(&tx, &candidate.url)?
            .ok_or_else(|| super::RepositoryError::NotFound(candidate.url.clone()))?;
        tx.commit()?;
        Ok(record)
    }

    /// Record a failed metadata probe. The fingerprint is left as it was.
    pub fn record_probe_failure(
        &self,
        candidate: &CandidateResource,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let class = &candidate.classification;
        conn.execute(
            r#"
            INSERT INTO resources (
                url, seed_url, section_name, data_type, legislature_tag, content_type,
                first_discovered_at, last_checked_at, discovery_status, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 'error', ?8)
            ON CONFLICT(url) DO UPDATE SET
                discovery_status = 'error',
                last_error = excluded.last_error,
                last_checked_at = excluded.last_checked_at
            "#,
            params![
                candidate.url,
                candidate.seed_url,
                class.section_name,
                class.data_type,
                class.legislature_tag,
                class.content_type,
                format_datetime(now),
                error,
            ],
        )?;
        Ok(())
    }

    /// Active resources last reported by any of the given seeds.
    pub fn active_urls_for_seeds(&self, seeds: &[String]) -> Result<Vec<String>> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let placeholders = vec!["?"; seeds.len()].join(", ");
        let sql = format!(
            "SELECT url FROM resources WHERE discovery_status = 'active' AND seed_url IN ({}) ORDER BY url",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let urls = stmt
            .query_map(params_from_iter(seeds.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(urls)
    }

    /// Mark a resource as gone from the source. Returns false if it was already inactive.
    pub fn mark_gone(&self, url: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE resources SET
                discovery_status = 'inactive',
                last_checked_at = ?2,
                last_error = ?3
            WHERE url = ?1 AND discovery_status != 'inactive'
            "#,
            params![url, format_datetime(now), reason],
        )?;
        Ok(changed > 0)
    }

    /// Count resources per discovery status.
    pub fn count_by_status(&self) -> Result<HashMap<DiscoveryStatus, u64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT discovery_status, COUNT(*) FROM resources GROUP BY discovery_status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = DiscoveryStatus::from_str(&status) {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }

    /// Count resources that changed and have not been imported since.
    pub fn count_changed(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE changed_since_last_import = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Count resources the classification rules could not place.
    pub fn count_unclassified(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE section_name = ? AND data_type = ?",
            params![crate::models::UNCLASSIFIED, crate::models::UNCLASSIFIED],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn candidate_missing_status(candidate: &CandidateResource) -> String {
    match &candidate.probe {
        crate::models::ProbeOutcome::Missing { status } => format!("HTTP {}", status),
        _ => "no longer listed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChangeMethod, Classification, Fingerprint, ProbeOutcome, RemoteMetadata,
    };

    fn candidate(url: &str, etag: &str) -> CandidateResource {
        CandidateResource {
            url: url.to_string(),
            seed_url: "https://dati.example.org/".to_string(),
            classification: Classification {
                section_name: "deputati".to_string(),
                data_type: "member".to_string(),
                legislature_tag: "leg19".to_string(),
                content_type: "application/xml".to_string(),
            },
            probe: ProbeOutcome::Found(RemoteMetadata {
                status: 200,
                etag: Some(etag.to_string()),
                ..Default::default()
            }),
        }
    }

    fn detection(decision: ChangeDecision, etag: &str) -> Detection {
        Detection {
            decision,
            fingerprint: Fingerprint {
                etag: Some(etag.to_string()),
                ..Default::default()
            },
            method: Some(ChangeMethod::Etag),
            hash_verified: false,
        }
    }

    fn repo() -> (tempfile::TempDir, ResourceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = ResourceRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_new_then_unchanged_only_advances_last_checked() {
        let (_dir, repo) = repo();
        let c = candidate("https://dati.example.org/a.xml", "\"v1\"");
        let t0 = Utc::now();
        let first = repo
            .apply_detection(&c, &detection(ChangeDecision::New, "\"v1\""), t0)
            .unwrap();
        assert!(first.changed_since_last_import);
        assert_eq!(first.last_change_at, Some(parse(t0)));

        let t1 = t0 + chrono::Duration::seconds(30);
        let second = repo
            .apply_detection(&c, &detection(ChangeDecision::Unchanged, "\"v1\""), t1)
            .unwrap();
        assert_eq!(second.last_checked_at, parse(t1));
        assert_eq!(
            ResourceRecord {
                last_checked_at: first.last_checked_at,
                ..second
            },
            first
        );
    }

    #[test]
    fn test_gone_keeps_record_inactive() {
        let (_dir, repo) = repo();
        let c = candidate("https://dati.example.org/a.xml", "\"v1\"");
        let now = Utc::now();
        repo.apply_detection(&c, &detection(ChangeDecision::New, "\"v1\""), now)
            .unwrap();

        assert!(repo.mark_gone(&c.url, "no longer listed", now).unwrap());
        assert!(!repo.mark_gone(&c.url, "no longer listed", now).unwrap());

        let record = repo.get(&c.url).unwrap().unwrap();
        assert_eq!(record.discovery_status, DiscoveryStatus::Inactive);
        assert_eq!(record.current_etag.as_deref(), Some("\"v1\""));
    }

    #[test]
    fn test_active_urls_for_seeds() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        let a = candidate("https://dati.example.org/a.xml", "1");
        let mut b = candidate("https://dati.example.org/b.xml", "1");
        b.seed_url = "https://dati.example.org/other".to_string();
        repo.apply_detection(&a, &detection(ChangeDecision::New, "1"), now)
            .unwrap();
        repo.apply_detection(&b, &detection(ChangeDecision::New, "1"), now)
            .unwrap();

        let urls = repo
            .active_urls_for_seeds(&["https://dati.example.org/".to_string()])
            .unwrap();
        assert_eq!(urls, vec!["https://dati.example.org/a.xml".to_string()]);
    }

    fn parse(dt: DateTime<Utc>) -> DateTime<Utc> {
        super::super::parse_datetime(&format_datetime(dt))
    }
}
