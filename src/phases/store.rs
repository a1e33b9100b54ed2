use anyhow::Result;
use log::info;

use crate::db::{models::Phase, Database, PHASE_CONFIG_SLOT};

use super::normalize::{default_phases, normalize_phases};

/// Persisted phase template, loaded once at startup and normalized before
/// anything consumes it.
#[derive(Clone)]
pub struct PhaseStore {
    db: Database,
    slot: String,
}

impl PhaseStore {
    pub fn new(db: Database) -> Self {
        Self::with_slot(db, PHASE_CONFIG_SLOT)
    }

    pub fn with_slot(db: Database, slot: &str) -> Self {
        Self {
            db,
            slot: slot.to_string(),
        }
    }

    /// First run seeds the default template. Stored templates that fail
    /// normalization checks are rewritten in canonical form.
    pub async fn load(&self) -> Result<Vec<Phase>> {
        match self.db.load_phases(&self.slot).await? {
            None => {
                let phases = default_phases();
                info!("No phase template stored in {}; seeding defaults", self.slot);
                self.db.save_phases(&self.slot, &phases).await?;
                Ok(phases)
            }
            Some(stored) => {
                let phases = normalize_phases(stored.clone());
                if phases != stored {
                    info!("Normalized stored phase template in {}", self.slot);
                    self.db.save_phases(&self.slot, &phases).await?;
                }
                Ok(phases)
            }
        }
    }

    pub async fn save(&self, phases: &[Phase]) -> Result<()> {
        self.db.save_phases(&self.slot, phases).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_load_seeds_defaults() {
        let db = Database::in_memory().unwrap();
        let store = PhaseStore::new(db.clone());
        let phases = store.load().await.unwrap();
        assert_eq!(phases, default_phases());
        assert_eq!(db.load_phases(PHASE_CONFIG_SLOT).await.unwrap(), Some(phases));
    }

    #[tokio::test]
    async fn stored_template_is_normalized_and_rewritten() {
        let db = Database::in_memory().unwrap();
        let store = PhaseStore::with_slot(db.clone(), "custom");
        let messy = vec![
            Phase::new("a", "A", "#abc123", '5', 0),
            Phase::new("b", "B", "#def456", '5', 1),
        ];
        store.save(&messy).await.unwrap();

        let phases = store.load().await.unwrap();
        assert_eq!(phases[0].color, "#ABC123");
        assert_eq!(phases[1].shortcut, Some('1'));
        let persisted = db.load_phases("custom").await.unwrap().unwrap();
        assert_eq!(persisted, phases);
    }

    #[tokio::test]
    async fn empty_template_survives_reload() {
        let db = Database::in_memory().unwrap();
        let store = PhaseStore::new(db);
        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
