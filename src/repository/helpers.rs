//! Row parsing helpers shared by the repositories.

use super::{parse_datetime, parse_datetime_opt};
use crate::models::{
    ChangeMethod, DiscoveryStatus, ImportState, ImportStatus, PipelineRun, ResourceRecord,
    RunMode, RunPhase,
};

/// Parse a database row into a ResourceRecord.
pub fn row_to_resource(row: &rusqlite::Row) -> rusqlite::Result<ResourceRecord> {
    Ok(ResourceRecord {
        url: row.get("url")?,
        seed_url: row.get("seed_url")?,
        section_name: row.get("section_name")?,
        data_type: row.get("data_type")?,
        legislature_tag: row.get("legislature_tag")?,
        content_type: row.get("content_type")?,
        first_discovered_at: parse_datetime(&row.get::<_, String>("first_discovered_at")?),
        last_checked_at: parse_datetime(&row.get::<_, String>("last_checked_at")?),
        discovery_status: DiscoveryStatus::from_str(&row.get::<_, String>("discovery_status")?)
            .unwrap_or(DiscoveryStatus::Error),
        current_etag: row.get("current_etag")?,
        current_last_modified: row.get("current_last_modified")?,
        current_content_hash: row.get("current_content_hash")?,
        current_size: row
            .get::<_, Option<i64>>("current_size")?
            .map(|s| s as u64),
        changed_since_last_import: row.get::<_, i32>("changed_since_last_import")? != 0,
        last_change_at: parse_datetime_opt(row.get("last_change_at")?),
        change_detection_method: row
            .get::<_, Option<String>>("change_detection_method")?
            .and_then(|s| ChangeMethod::from_str(&s)),
        hash_verified_at: parse_datetime_opt(row.get("hash_verified_at")?),
        last_error: row.get("last_error")?,
        linked_import_status_id: row.get("linked_import_status_id")?,
    })
}

/// Parse a database row into an ImportStatus.
pub fn row_to_import_status(row: &rusqlite::Row) -> rusqlite::Result<ImportStatus> {
    Ok(ImportStatus {
        id: row.get("id")?,
        resource_url: row.get("resource_url")?,
        content_hash: row.get("content_hash")?,
        state: ImportState::from_str(&row.get::<_, String>("state")?)
            .unwrap_or(ImportState::Failed),
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        next_retry_at: parse_datetime_opt(row.get("next_retry_at")?),
        last_error: row.get("last_error")?,
        processing_duration_ms: row
            .get::<_, Option<i64>>("processing_duration_ms")?
            .map(|d| d as u64),
        permanent: row.get::<_, i32>("permanent")? != 0,
        lease_owner: row.get("lease_owner")?,
        lease_expires_at: parse_datetime_opt(row.get("lease_expires_at")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        started_at: parse_datetime_opt(row.get("started_at")?),
        finished_at: parse_datetime_opt(row.get("finished_at")?),
    })
}

/// Parse a database row into a PipelineRun.
pub fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<PipelineRun> {
    let counters_str: String = row.get("counters")?;
    Ok(PipelineRun {
        id: row.get("id")?,
        mode: RunMode::from_str(&row.get::<_, String>("mode")?).unwrap_or(RunMode::Full),
        force: row.get::<_, i32>("force")? != 0,
        phase: RunPhase::from_str(&row.get::<_, String>("phase")?).unwrap_or(RunPhase::Idle),
        started_at: parse_datetime(&row.get::<_, String>("started_at")?),
        finished_at: parse_datetime_opt(row.get("finished_at")?),
        counters: serde_json::from_str(&counters_str).unwrap_or_default(),
        error: row.get("error")?,
    })
}
