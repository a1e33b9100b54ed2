use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Segment, TrialKey, VersionMeta};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Dirty,
    Syncing,
    Synced,
    Error,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Dirty => "dirty",
            DraftStatus::Syncing => "syncing",
            DraftStatus::Synced => "synced",
            DraftStatus::Error => "error",
        }
    }

    /// Whether a sync trigger should pick this draft up.
    pub fn is_pending(&self) -> bool {
        matches!(self, DraftStatus::Dirty | DraftStatus::Error)
    }
}

/// Deterministic draft key; at most one live draft exists per key.
pub fn draft_id(file_id: &str, trial_index: u32, user_id: &str) -> String {
    format!("{file_id}::{trial_index}::{user_id}")
}

/// Unsynced local override of one trial's segments for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,
    pub file_id: String,
    pub trial_index: u32,
    pub user_id: String,
    pub username: Option<String>,
    pub segments: Vec<Segment>,
    pub status: DraftStatus,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub version_meta: Option<VersionMeta>,
}

impl Draft {
    pub fn new(
        key: &TrialKey,
        user_id: &str,
        username: Option<String>,
        segments: Vec<Segment>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: draft_id(&key.file_id, key.trial_index, user_id),
            file_id: key.file_id.clone(),
            trial_index: key.trial_index,
            user_id: user_id.to_string(),
            username,
            segments,
            status: DraftStatus::Dirty,
            updated_at: now,
            last_synced_at: None,
            error: None,
            version_meta: None,
        }
    }

    pub fn trial_key(&self) -> TrialKey {
        TrialKey::new(self.file_id.clone(), self.trial_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_id_is_stable_per_user_and_trial() {
        assert_eq!(draft_id("a/b.h5", 3, "u1"), "a/b.h5::3::u1");
        assert_ne!(draft_id("a/b.h5", 3, "u1"), draft_id("a/b.h5", 3, "u2"));
    }

    #[test]
    fn error_drafts_are_retried() {
        assert!(DraftStatus::Error.is_pending());
        assert!(DraftStatus::Dirty.is_pending());
        assert!(!DraftStatus::Syncing.is_pending());
    }
}
