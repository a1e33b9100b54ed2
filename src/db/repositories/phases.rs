use anyhow::Result;
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{parse_shortcut, to_i64, to_usize},
    models::Phase,
};

/// Storage slot holding the annotator's phase template.
pub const PHASE_CONFIG_SLOT: &str = "annotation-phases";

impl Database {
    /// Returns `None` when the slot has never been written, so callers can
    /// tell "empty template" apart from "first run".
    pub async fn load_phases(&self, slot: &str) -> Result<Option<Vec<Phase>>> {
        let slot = slot.to_string();
        self.execute(move |conn| {
            let written: i64 = conn.query_row(
                "SELECT COUNT(*) FROM phase_config WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )?;
            if written == 0 {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT position, id, name, color, shortcut
                 FROM phase_config
                 WHERE slot = ?1 AND position >= 0
                 ORDER BY position ASC",
            )?;
            let mut rows = stmt.query(params![slot])?;
            let mut phases = Vec::new();
            while let Some(row) = rows.next()? {
                let position: i64 = row.get(0)?;
                phases.push(Phase {
                    id: row.get(1)?,
                    name: row.get(2)?,
                    color: row.get(3)?,
                    shortcut: parse_shortcut(row.get(4)?),
                    order: Some(to_usize(position, "position")?),
                });
            }

            Ok(Some(phases))
        })
        .await
    }

    /// Replaces the whole slot. An empty template is stored as a marker row
    /// at position -1 so it survives a restart as "empty".
    pub async fn save_phases(&self, slot: &str, phases: &[Phase]) -> Result<()> {
        let slot = slot.to_string();
        let phases = phases.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM phase_config WHERE slot = ?1", params![slot])?;

            if phases.is_empty() {
                tx.execute(
                    "INSERT INTO phase_config (slot, position, id, name, color, shortcut)
                     VALUES (?1, -1, '', '', '', NULL)",
                    params![slot],
                )?;
            }

            for (position, phase) in phases.iter().enumerate() {
                tx.execute(
                    "INSERT INTO phase_config (slot, position, id, name, color, shortcut)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        slot,
                        to_i64(position)?,
                        phase.id,
                        phase.name,
                        phase.color,
                        phase.shortcut.map(|c| c.to_string()),
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unwritten_slot_reads_as_none() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.load_phases(PHASE_CONFIG_SLOT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_template_survives_round_trip() {
        let db = Database::in_memory().unwrap();
        db.save_phases(PHASE_CONFIG_SLOT, &[]).await.unwrap();
        assert_eq!(db.load_phases(PHASE_CONFIG_SLOT).await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn phases_keep_their_order() {
        let db = Database::in_memory().unwrap();
        let phases = vec![
            Phase::new("b", "Second", "#111111", '2', 0),
            Phase::new("a", "First", "#222222", '1', 1),
        ];
        db.save_phases(PHASE_CONFIG_SLOT, &phases).await.unwrap();
        let loaded = db.load_phases(PHASE_CONFIG_SLOT).await.unwrap().unwrap();
        assert_eq!(loaded, phases);
    }
}
