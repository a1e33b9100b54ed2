//! Draft & synchronization engine.
//!
//! Owns every unsynced draft. Drafts live in memory for fast access and are
//! mirrored to SQLite so they survive restarts. Uploads for one draft are
//! strictly serialized; each upload is tagged with the draft's edit
//! generation so a result that lands after the draft was edited or
//! discarded is never applied. SQLite writes are issued while the draft
//! book is locked, so disk order always matches book order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    api::{with_timeout, AnnotationApi, SyncRequest, SyncResult},
    db::{
        models::{draft_id, Draft, DraftStatus, Segment, TrialKey, VersionMeta, VersionStatus},
        Database,
    },
    identity::UserIdentity,
};
use crate::{log_debug, log_error, log_info, log_warn};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark::sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    InFlight,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Server accepted the upload and the draft is gone.
    Synced {
        draft_id: String,
        key: TrialKey,
        user_id: String,
        result: SyncResult,
    },
    /// Server accepted an older snapshot; the draft was edited meanwhile
    /// and stays queued.
    Superseded {
        draft_id: String,
        result: SyncResult,
    },
    Failed {
        draft_id: String,
        error: String,
    },
    /// The draft was discarded while its upload was in flight.
    Stale { draft_id: String },
    Skipped {
        draft_id: String,
        reason: SkipReason,
    },
}

impl SyncOutcome {
    pub fn draft_id(&self) -> &str {
        match self {
            SyncOutcome::Synced { draft_id, .. }
            | SyncOutcome::Superseded { draft_id, .. }
            | SyncOutcome::Failed { draft_id, .. }
            | SyncOutcome::Stale { draft_id }
            | SyncOutcome::Skipped { draft_id, .. } => draft_id,
        }
    }
}

#[derive(Default)]
struct DraftBook {
    drafts: HashMap<String, Draft>,
    generations: HashMap<String, u64>,
    in_flight: HashSet<String>,
    next_generation: u64,
}

impl DraftBook {
    fn bump(&mut self, id: &str) -> u64 {
        self.next_generation += 1;
        self.generations.insert(id.to_string(), self.next_generation);
        self.next_generation
    }
}

#[derive(Clone)]
pub struct DraftSyncEngine {
    book: Arc<Mutex<DraftBook>>,
    db: Database,
    api: Arc<dyn AnnotationApi>,
    request_timeout: Duration,
    target_status: Arc<Mutex<VersionStatus>>,
}

impl DraftSyncEngine {
    pub fn new(db: Database, api: Arc<dyn AnnotationApi>, request_timeout: Duration) -> Self {
        Self {
            book: Arc::new(Mutex::new(DraftBook::default())),
            db,
            api,
            request_timeout,
            target_status: Arc::new(Mutex::new(VersionStatus::Active)),
        }
    }

    pub async fn set_target_status(&self, status: VersionStatus) {
        *self.target_status.lock().await = status;
    }

    /// Loads persisted drafts. Drafts a previous process left mid-upload
    /// are queued again as dirty.
    pub async fn restore(&self) -> Result<usize> {
        let recovered = self.db.recover_interrupted_syncs().await?;
        if recovered > 0 {
            log_warn!("Re-queued {} drafts interrupted mid-sync", recovered);
        }

        let drafts = self.db.list_drafts().await?;
        let mut book = self.book.lock().await;
        for draft in drafts {
            book.bump(&draft.id);
            book.drafts.insert(draft.id.clone(), draft);
        }
        log_info!("Restored {} local drafts", book.drafts.len());
        Ok(book.drafts.len())
    }

    /// Records `segments` as the user's current draft for `key`. Any
    /// previous error is cleared: an edit puts the draft back to dirty.
    pub async fn stage(
        &self,
        key: &TrialKey,
        user: &UserIdentity,
        segments: Vec<Segment>,
        version_meta: Option<VersionMeta>,
    ) -> Result<Draft> {
        let id = draft_id(&key.file_id, key.trial_index, &user.user_id);
        let now = Utc::now();
        let segments: Vec<Segment> = segments
            .into_iter()
            .map(|segment| Segment {
                synced: false,
                ..segment
            })
            .collect();

        let draft = {
            let mut book = self.book.lock().await;
            let draft = match book.drafts.remove(&id) {
                Some(existing) => Draft {
                    segments,
                    status: DraftStatus::Dirty,
                    updated_at: now,
                    error: None,
                    username: user.username.clone(),
                    version_meta: version_meta.or(existing.version_meta),
                    ..existing
                },
                None => Draft {
                    version_meta,
                    ..Draft::new(key, &user.user_id, user.username.clone(), segments, now)
                },
            };
            self.db.upsert_draft(&draft).await?;
            book.bump(&id);
            book.drafts.insert(id.clone(), draft.clone());
            draft
        };

        log_debug!("Staged draft {} with {} segments", id, draft.segments.len());
        Ok(draft)
    }

    pub async fn get(&self, id: &str) -> Option<Draft> {
        self.book.lock().await.drafts.get(id).cloned()
    }

    pub async fn draft_for(&self, key: &TrialKey, user_id: &str) -> Option<Draft> {
        self.get(&draft_id(&key.file_id, key.trial_index, user_id))
            .await
    }

    /// Every draft, most recently edited first.
    pub async fn list(&self) -> Vec<Draft> {
        let book = self.book.lock().await;
        let mut drafts: Vec<Draft> = book.drafts.values().cloned().collect();
        drafts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        drafts
    }

    pub async fn has_pending(&self) -> bool {
        self.book
            .lock()
            .await
            .drafts
            .values()
            .any(|draft| draft.status.is_pending())
    }

    pub async fn is_in_flight(&self, id: &str) -> bool {
        self.book.lock().await.in_flight.contains(id)
    }

    pub async fn discard(&self, id: &str) -> Result<bool> {
        let mut book = self.book.lock().await;
        let deleted = self.db.delete_draft(id).await?;
        book.generations.remove(id);
        let removed = book.drafts.remove(id).is_some();
        if removed || deleted {
            log_info!("Discarded draft {}", id);
        }
        Ok(removed || deleted)
    }

    /// Uploads one draft. A call for a draft whose upload is already in
    /// flight returns `Skipped` without touching it.
    pub async fn sync_draft(&self, id: &str) -> SyncOutcome {
        let (draft, generation) = {
            let mut book = self.book.lock().await;
            if book.in_flight.contains(id) {
                log_debug!("Sync for {} already in flight; skipping", id);
                return SyncOutcome::Skipped {
                    draft_id: id.to_string(),
                    reason: SkipReason::InFlight,
                };
            }
            let generation = book.generations.get(id).copied().unwrap_or_default();
            let Some(draft) = book.drafts.get_mut(id) else {
                return SyncOutcome::Skipped {
                    draft_id: id.to_string(),
                    reason: SkipReason::NotFound,
                };
            };
            draft.status = DraftStatus::Syncing;
            let snapshot = draft.clone();
            book.in_flight.insert(id.to_string());
            if let Err(err) = self
                .db
                .update_draft_status(id, DraftStatus::Syncing, None, None)
                .await
            {
                log_error!("Failed to persist syncing status for {}: {err:#}", id);
            }
            (snapshot, generation)
        };

        // The server stamps our version with its receive time, which can be
        // later than an edit made while the previous upload was in flight.
        let client_updated_at = match draft.last_synced_at {
            Some(synced_at) => draft.updated_at.max(synced_at),
            None => draft.updated_at,
        };
        let request = SyncRequest {
            segments: draft.segments.clone(),
            client_updated_at,
            status: *self.target_status.lock().await,
        };
        let key = draft.trial_key();
        let response = with_timeout(self.request_timeout, self.api.sync(&key, &request)).await;

        let mut guard = self.book.lock().await;
        let book = &mut *guard;
        let outcome = {
            book.in_flight.remove(id);
            let fresh = book.generations.get(id).copied() == Some(generation);

            if !book.drafts.contains_key(id) {
                log_warn!("Dropping sync result for discarded draft {}", id);
                SyncOutcome::Stale {
                    draft_id: id.to_string(),
                }
            } else {
                match response {
                    Ok(result) if fresh => {
                        book.drafts.remove(id);
                        book.generations.remove(id);
                        SyncOutcome::Synced {
                            draft_id: id.to_string(),
                            key,
                            user_id: draft.user_id.clone(),
                            result,
                        }
                    }
                    Ok(result) => {
                        if let Some(current) = book.drafts.get_mut(id) {
                            current.status = DraftStatus::Dirty;
                            current.last_synced_at = Some(result.synced_at);
                        }
                        SyncOutcome::Superseded {
                            draft_id: id.to_string(),
                            result,
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if let Some(current) = book.drafts.get_mut(id) {
                            // A newer edit already put the draft back to dirty.
                            if fresh {
                                current.status = DraftStatus::Error;
                            }
                            current.error = Some(message.clone());
                        }
                        SyncOutcome::Failed {
                            draft_id: id.to_string(),
                            error: message,
                        }
                    }
                }
            }
        };

        self.persist_outcome(book, &outcome).await;
        outcome
    }

    async fn persist_outcome(&self, book: &DraftBook, outcome: &SyncOutcome) {
        let result = match outcome {
            SyncOutcome::Synced { draft_id, result, .. } => {
                log_info!(
                    "Draft {} synced as version {} ({} segments)",
                    draft_id,
                    result.version_id,
                    result.segment_count
                );
                self.db.delete_draft(draft_id).await.map(|_| ())
            }
            SyncOutcome::Superseded { draft_id, result } => {
                log_info!("Draft {} edited during sync; keeping it queued", draft_id);
                self.persist_status(book, draft_id, Some(result.synced_at)).await
            }
            SyncOutcome::Failed { draft_id, error } => {
                log_error!("Sync failed for draft {}: {}", draft_id, error);
                self.persist_status(book, draft_id, None).await
            }
            SyncOutcome::Stale { .. } | SyncOutcome::Skipped { .. } => Ok(()),
        };
        if let Err(err) = result {
            log_error!("Failed to persist outcome for {}: {err:#}", outcome.draft_id());
        }
    }

    async fn persist_status(
        &self,
        book: &DraftBook,
        id: &str,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match book.drafts.get(id) {
            Some(draft) => {
                self.db
                    .update_draft_status(id, draft.status, draft.error.clone(), synced_at)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Attempts every dirty or failed draft, newest first, one at a time.
    pub async fn sync_all(&self) -> Vec<SyncOutcome> {
        let pending: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|draft| draft.status.is_pending())
            .map(|draft| draft.id)
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for id in pending {
            outcomes.push(self.sync_draft(&id).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryBackend;
    use crate::annotation::events::fixtures::segment;

    fn alice() -> UserIdentity {
        UserIdentity {
            user_id: "alice".into(),
            username: Some("Alice".into()),
        }
    }

    fn key() -> TrialKey {
        TrialKey::new("trial.h5", 0)
    }

    fn engine(backend: &MemoryBackend, db: Database) -> DraftSyncEngine {
        DraftSyncEngine::new(
            db,
            Arc::new(backend.client("alice", Some("Alice"))),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn successful_sync_removes_draft_everywhere() {
        let backend = MemoryBackend::new();
        let db = Database::in_memory().unwrap();
        let engine = engine(&backend, db.clone());
        let draft = engine
            .stage(&key(), &alice(), vec![segment("s1", "a", 0, 1.0, 2.0)], None)
            .await
            .unwrap();

        let outcome = engine.sync_draft(&draft.id).await;
        let SyncOutcome::Synced { result, .. } = outcome else {
            panic!("expected synced, got {outcome:?}");
        };
        assert_eq!(result.segment_count, 1);
        assert!(engine.get(&draft.id).await.is_none());
        assert!(db.list_drafts().await.unwrap().is_empty());
        assert_eq!(backend.version_segments(&result.version_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_marks_error_and_keeps_draft_queued() {
        let backend = MemoryBackend::new();
        let db = Database::in_memory().unwrap();
        let engine = engine(&backend, db.clone());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        backend.fail_next(1);
        let outcome = engine.sync_draft(&draft.id).await;
        assert!(matches!(outcome, SyncOutcome::Failed { .. }));

        let stored = engine.get(&draft.id).await.unwrap();
        assert_eq!(stored.status, DraftStatus::Error);
        assert!(stored.error.unwrap().contains("injected failure"));
        assert_eq!(db.list_drafts().await.unwrap()[0].status, DraftStatus::Error);
        assert!(engine.has_pending().await);

        // Retried by the next pass.
        let outcomes = engine.sync_all().await;
        assert!(matches!(outcomes[0], SyncOutcome::Synced { .. }));
    }

    #[tokio::test]
    async fn edit_after_error_returns_to_dirty() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, Database::in_memory().unwrap());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();
        backend.set_offline(true);
        engine.sync_draft(&draft.id).await;

        let restaged = engine
            .stage(&key(), &alice(), vec![segment("s1", "a", 0, 1.0, 2.0)], None)
            .await
            .unwrap();
        assert_eq!(restaged.status, DraftStatus::Dirty);
        assert_eq!(restaged.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_request_for_same_draft_is_skipped() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(1)));
        let engine = engine(&backend, Database::in_memory().unwrap());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let first = {
            let engine = engine.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { engine.sync_draft(&id).await })
        };
        while !engine.is_in_flight(&draft.id).await {
            tokio::task::yield_now().await;
        }
        let second = engine.sync_draft(&draft.id).await;
        assert_eq!(
            second,
            SyncOutcome::Skipped {
                draft_id: draft.id.clone(),
                reason: SkipReason::InFlight
            }
        );

        assert!(matches!(first.await.unwrap(), SyncOutcome::Synced { .. }));
        assert_eq!(backend.sync_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_discarded_draft_is_dropped() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(1)));
        let engine = engine(&backend, Database::in_memory().unwrap());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let pending = {
            let engine = engine.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { engine.sync_draft(&id).await })
        };
        while !engine.is_in_flight(&draft.id).await {
            tokio::task::yield_now().await;
        }
        assert!(engine.discard(&draft.id).await.unwrap());

        let outcome = pending.await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Stale {
                draft_id: draft.id.clone()
            }
        );
        assert!(engine.get(&draft.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_sync_keeps_draft_dirty() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(1)));
        let engine = engine(&backend, Database::in_memory().unwrap());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let pending = {
            let engine = engine.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { engine.sync_draft(&id).await })
        };
        while !engine.is_in_flight(&draft.id).await {
            tokio::task::yield_now().await;
        }
        engine
            .stage(&key(), &alice(), vec![segment("s1", "a", 0, 1.0, 2.0)], None)
            .await
            .unwrap();

        assert!(matches!(pending.await.unwrap(), SyncOutcome::Superseded { .. }));
        let current = engine.get(&draft.id).await.unwrap();
        assert_eq!(current.status, DraftStatus::Dirty);
        assert_eq!(current.segments.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_draft_syncs_on_retry() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_millis(50)));
        let db = Database::in_memory().unwrap();
        let engine = engine(&backend, db.clone());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let pending = {
            let engine = engine.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { engine.sync_draft(&id).await })
        };
        while !engine.is_in_flight(&draft.id).await {
            tokio::task::yield_now().await;
        }
        engine
            .stage(&key(), &alice(), vec![segment("s1", "a", 0, 1.0, 2.0)], None)
            .await
            .unwrap();
        assert!(matches!(pending.await.unwrap(), SyncOutcome::Superseded { .. }));

        let retry = engine.sync_draft(&draft.id).await;
        let SyncOutcome::Synced { result, .. } = retry else {
            panic!("expected synced, got {retry:?}");
        };
        assert_eq!(result.segment_count, 1);
        assert!(engine.get(&draft.id).await.is_none());
        assert!(db.list_drafts().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn edit_queued_behind_sync_result_stays_on_disk() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(1)));
        let db = Database::in_memory().unwrap();
        let engine = engine(&backend, db.clone());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let sync = {
            let engine = engine.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { engine.sync_draft(&id).await })
        };
        while !engine.is_in_flight(&draft.id).await {
            tokio::task::yield_now().await;
        }

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // Hold the book until the upload has returned and the sync task
        // waits for it, then queue an edit behind the sync task.
        let guard = engine.book.lock().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let edit = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .stage(&key(), &alice(), vec![segment("s2", "a", 0, 3.0, 4.0)], None)
                    .await
            })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        assert!(matches!(sync.await.unwrap(), SyncOutcome::Synced { .. }));
        edit.await.unwrap().unwrap();

        let stored = db.list_drafts().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].segments.len(), 1);
        assert_eq!(engine.get(&draft.id).await.unwrap().segments.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_server_counts_as_failure() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(120)));
        let engine = engine(&backend, Database::in_memory().unwrap());
        let draft = engine.stage(&key(), &alice(), Vec::new(), None).await.unwrap();

        let outcome = engine.sync_draft(&draft.id).await;
        let SyncOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn restore_requeues_interrupted_drafts() {
        let backend = MemoryBackend::new();
        let db = Database::in_memory().unwrap();
        let first = engine(&backend, db.clone());
        let draft = first.stage(&key(), &alice(), Vec::new(), None).await.unwrap();
        db.update_draft_status(&draft.id, DraftStatus::Syncing, None, None)
            .await
            .unwrap();

        let second = engine(&backend, db);
        assert_eq!(second.restore().await.unwrap(), 1);
        let restored = second.get(&draft.id).await.unwrap();
        assert_eq!(restored.status, DraftStatus::Dirty);
        assert!(second.has_pending().await);
    }
}
