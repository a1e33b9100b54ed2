use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row, Transaction};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_draft_status, parse_optional_datetime, to_i64, to_u32, to_usize},
    models::{Draft, DraftStatus, Segment, VersionMeta},
};

fn row_to_draft(row: &Row) -> Result<Draft> {
    let trial_index: i64 = row.get("trial_index")?;
    let status: String = row.get("status")?;
    let updated_at: String = row.get("updated_at")?;
    let last_synced_at: Option<String> = row.get("last_synced_at")?;
    let version_meta: Option<String> = row.get("version_meta")?;

    Ok(Draft {
        id: row.get("id")?,
        file_id: row.get("file_id")?,
        trial_index: to_u32(trial_index, "trial_index")?,
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        segments: Vec::new(),
        status: parse_draft_status(&status)?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
        last_synced_at: parse_optional_datetime(last_synced_at, "last_synced_at")?,
        error: row.get("error")?,
        version_meta: version_meta
            .map(|raw| serde_json::from_str::<VersionMeta>(&raw))
            .transpose()
            .context("failed to parse version_meta")?,
    })
}

fn row_to_segment(row: &Row, draft: &Draft) -> Result<Segment> {
    let start_index: i64 = row.get("start_index")?;
    let end_index: i64 = row.get("end_index")?;
    let event_index: i64 = row.get("event_index")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Segment {
        id: row.get("id")?,
        file_id: draft.file_id.clone(),
        trial_index: draft.trial_index,
        phase_id: row.get("phase_id")?,
        phase_name: row.get("phase_name")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        start_index: to_usize(start_index, "start_index")?,
        end_index: to_usize(end_index, "end_index")?,
        event_index: to_u32(event_index, "event_index")?,
        color: row.get("color")?,
        label: row.get("label")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
        synced: false,
        user_id: row.get("user_id")?,
        version_id: row.get("version_id")?,
    })
}

fn insert_segments(tx: &Transaction<'_>, draft: &Draft) -> Result<()> {
    tx.execute(
        "DELETE FROM draft_segments WHERE draft_id = ?1",
        params![draft.id],
    )?;

    for (position, segment) in draft.segments.iter().enumerate() {
        tx.execute(
            "INSERT INTO draft_segments (
                draft_id,
                position,
                id,
                phase_id,
                phase_name,
                start_time,
                end_time,
                start_index,
                end_index,
                event_index,
                color,
                label,
                created_at,
                updated_at,
                user_id,
                version_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                draft.id,
                to_i64(position)?,
                segment.id,
                segment.phase_id,
                segment.phase_name,
                segment.start_time,
                segment.end_time,
                to_i64(segment.start_index)?,
                to_i64(segment.end_index)?,
                segment.event_index,
                segment.color,
                segment.label,
                segment.created_at.to_rfc3339(),
                segment.updated_at.to_rfc3339(),
                segment.user_id,
                segment.version_id,
            ],
        )?;
    }
    Ok(())
}

impl Database {
    /// Inserts or fully replaces a draft together with its segments.
    pub async fn upsert_draft(&self, draft: &Draft) -> Result<()> {
        let record = draft.clone();
        self.execute(move |conn| {
            let version_meta = record
                .version_meta
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO drafts (id, file_id, trial_index, user_id, username, status, updated_at, last_synced_at, error, version_meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     username = excluded.username,
                     status = excluded.status,
                     updated_at = excluded.updated_at,
                     last_synced_at = excluded.last_synced_at,
                     error = excluded.error,
                     version_meta = excluded.version_meta",
                params![
                    record.id,
                    record.file_id,
                    record.trial_index,
                    record.user_id,
                    record.username,
                    record.status.as_str(),
                    record.updated_at.to_rfc3339(),
                    record.last_synced_at.map(|dt| dt.to_rfc3339()),
                    record.error,
                    version_meta,
                ],
            )
            .with_context(|| format!("failed to upsert draft {}", record.id))?;
            insert_segments(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn update_draft_status(
        &self,
        draft_id: &str,
        status: DraftStatus,
        error: Option<String>,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let draft_id = draft_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE drafts
                 SET status = ?1,
                     error = ?2,
                     last_synced_at = COALESCE(?3, last_synced_at)
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    error,
                    last_synced_at.map(|dt| dt.to_rfc3339()),
                    draft_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Segments are removed through ON DELETE CASCADE.
    pub async fn delete_draft(&self, draft_id: &str) -> Result<bool> {
        let draft_id = draft_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute("DELETE FROM drafts WHERE id = ?1", params![draft_id])?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn list_drafts(&self) -> Result<Vec<Draft>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_id, trial_index, user_id, username, status, updated_at, last_synced_at, error, version_meta
                 FROM drafts
                 ORDER BY updated_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut drafts = Vec::new();
            while let Some(row) = rows.next()? {
                drafts.push(row_to_draft(row)?);
            }

            let mut segment_stmt = conn.prepare(
                "SELECT draft_id, id, phase_id, phase_name, start_time, end_time, start_index, end_index,
                        event_index, color, label, created_at, updated_at, user_id, version_id
                 FROM draft_segments
                 ORDER BY draft_id, position ASC",
            )?;
            let positions: HashMap<String, usize> = drafts
                .iter()
                .enumerate()
                .map(|(index, draft)| (draft.id.clone(), index))
                .collect();
            let mut rows = segment_stmt.query([])?;
            while let Some(row) = rows.next()? {
                let draft_id: String = row.get("draft_id")?;
                if let Some(&index) = positions.get(&draft_id) {
                    let segment = row_to_segment(row, &drafts[index])?;
                    drafts[index].segments.push(segment);
                }
            }

            Ok(drafts)
        })
        .await
    }

    /// Drafts left in `syncing` by a previous process never got an answer;
    /// put them back in the queue.
    pub async fn recover_interrupted_syncs(&self) -> Result<usize> {
        self.execute(|conn| {
            let rows_affected = conn.execute(
                "UPDATE drafts SET status = 'dirty' WHERE status = 'syncing'",
                [],
            )?;
            Ok(rows_affected)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TrialKey;

    fn segment(id: &str, start: f64, end: f64, event_index: u32) -> Segment {
        let now = Utc::now();
        Segment {
            id: id.into(),
            file_id: "f.h5".into(),
            trial_index: 2,
            phase_id: "baseline".into(),
            phase_name: "Baseline".into(),
            start_time: start,
            end_time: end,
            start_index: 1,
            end_index: 5,
            event_index,
            color: Some("#38BDF8".into()),
            label: Some("first".into()),
            created_at: now,
            updated_at: now,
            synced: false,
            user_id: Some("alice".into()),
            version_id: None,
        }
    }

    fn draft(segments: Vec<Segment>) -> Draft {
        Draft::new(
            &TrialKey::new("f.h5", 2),
            "alice",
            Some("Alice".into()),
            segments,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn draft_round_trips_with_segments() {
        let db = Database::in_memory().unwrap();
        let stored = draft(vec![segment("s1", 1.0, 2.0, 0), segment("s2", 2.0, 3.0, 0)]);
        db.upsert_draft(&stored).await.unwrap();

        let drafts = db.list_drafts().await.unwrap();
        assert_eq!(drafts.len(), 1);
        let loaded = &drafts[0];
        assert_eq!(loaded.id, stored.id);
        assert_eq!(loaded.segments.len(), 2);
        assert_eq!(loaded.segments[1].id, "s2");
        assert_eq!(loaded.segments[0].label.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn upsert_replaces_segments() {
        let db = Database::in_memory().unwrap();
        let mut stored = draft(vec![segment("s1", 1.0, 2.0, 0)]);
        db.upsert_draft(&stored).await.unwrap();
        stored.segments = vec![segment("s9", 4.0, 5.0, 1)];
        db.upsert_draft(&stored).await.unwrap();

        let drafts = db.list_drafts().await.unwrap();
        assert_eq!(drafts[0].segments.len(), 1);
        assert_eq!(drafts[0].segments[0].id, "s9");
    }

    #[tokio::test]
    async fn delete_cascades_and_reports_presence() {
        let db = Database::in_memory().unwrap();
        let stored = draft(vec![segment("s1", 1.0, 2.0, 0)]);
        db.upsert_draft(&stored).await.unwrap();
        assert!(db.delete_draft(&stored.id).await.unwrap());
        assert!(!db.delete_draft(&stored.id).await.unwrap());
        assert!(db.list_drafts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupted_syncs_return_to_dirty() {
        let db = Database::in_memory().unwrap();
        let stored = draft(Vec::new());
        db.upsert_draft(&stored).await.unwrap();
        db.update_draft_status(&stored.id, DraftStatus::Syncing, None, None)
            .await
            .unwrap();

        assert_eq!(db.recover_interrupted_syncs().await.unwrap(), 1);
        let drafts = db.list_drafts().await.unwrap();
        assert_eq!(drafts[0].status, DraftStatus::Dirty);
    }

    #[tokio::test]
    async fn error_status_keeps_message() {
        let db = Database::in_memory().unwrap();
        let stored = draft(Vec::new());
        db.upsert_draft(&stored).await.unwrap();
        db.update_draft_status(&stored.id, DraftStatus::Error, Some("timeout".into()), None)
            .await
            .unwrap();
        let drafts = db.list_drafts().await.unwrap();
        assert_eq!(drafts[0].status, DraftStatus::Error);
        assert_eq!(drafts[0].error.as_deref(), Some("timeout"));
    }
}
