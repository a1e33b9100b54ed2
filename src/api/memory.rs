//! In-process annotation store with the same semantics as the REST server:
//! per-user versions, newest-first listing, 409 on stale uploads, and the
//! legacy unversioned segment collection. Also supports fault injection,
//! which is what the sync engine's tests lean on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    AnnotationApi, ApiError, ApiResult, NewSegment, SyncRequest, SyncResult, TrialAnnotations,
};
use crate::db::models::{Segment, SegmentPatch, TrialKey, VersionMeta, VersionStatus};

#[derive(Debug, Clone)]
struct StoredVersion {
    id: String,
    key: TrialKey,
    user_id: String,
    username: Option<String>,
    status: VersionStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    segments: Vec<Segment>,
}

impl StoredVersion {
    fn meta_for(&self, caller: &str) -> VersionMeta {
        VersionMeta {
            id: self.id.clone(),
            file_id: self.key.file_id.clone(),
            trial_index: self.key.trial_index,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            status: self.status,
            segment_count: self.segments.len(),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
            is_owner: self.user_id == caller,
        }
    }
}

#[derive(Default)]
struct ServerState {
    versions: Vec<StoredVersion>,
    legacy: HashMap<TrialKey, Vec<Segment>>,
    offline: bool,
    fail_next: usize,
    latency: Option<Duration>,
    sync_calls: usize,
}

impl ServerState {
    fn versions_for(&self, key: &TrialKey) -> Vec<&StoredVersion> {
        let mut versions: Vec<&StoredVersion> =
            self.versions.iter().filter(|v| &v.key == key).collect();
        versions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        versions
    }

    fn gate(&mut self) -> ApiResult<()> {
        if self.offline {
            return Err(ApiError::Unavailable("backend offline".into()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ApiError::Server {
                status: 503,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// Shared server state. Hand out one `MemoryAnnotationApi` per user.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn client(&self, user_id: &str, username: Option<&str>) -> MemoryAnnotationApi {
        MemoryAnnotationApi {
            backend: self.clone(),
            user_id: user_id.to_string(),
            username: username.map(str::to_string),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// The next `count` calls fail with a 503.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn sync_calls(&self) -> usize {
        self.lock().sync_calls
    }

    pub fn seed_legacy(&self, key: &TrialKey, segments: Vec<Segment>) {
        self.lock().legacy.insert(key.clone(), segments);
    }

    pub fn legacy_segments(&self, key: &TrialKey) -> Vec<Segment> {
        self.lock().legacy.get(key).cloned().unwrap_or_default()
    }

    pub fn version_segments(&self, version_id: &str) -> Option<Vec<Segment>> {
        self.lock()
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .map(|v| v.segments.clone())
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

pub struct MemoryAnnotationApi {
    backend: MemoryBackend,
    user_id: String,
    username: Option<String>,
}

impl MemoryAnnotationApi {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

fn sort_by_start(segments: &mut [Segment]) {
    segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
}

#[async_trait]
impl AnnotationApi for MemoryAnnotationApi {
    async fn get_annotations(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> ApiResult<TrialAnnotations> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;

        let versions = state.versions_for(key);
        if versions.is_empty() {
            let mut segments = state.legacy.get(key).cloned().unwrap_or_default();
            for segment in &mut segments {
                segment.version_id = None;
            }
            sort_by_start(&mut segments);
            return Ok(TrialAnnotations {
                segments,
                versions: Vec::new(),
                active_version_id: None,
            });
        }

        let selected = match version_id {
            Some(requested) => versions
                .iter()
                .find(|v| v.id == requested)
                .ok_or_else(|| ApiError::NotFound(format!("version {requested}")))?,
            None => versions
                .iter()
                .find(|v| v.user_id == self.user_id)
                .unwrap_or(&versions[0]),
        };

        let mut segments = selected.segments.clone();
        for segment in &mut segments {
            segment.version_id = Some(selected.id.clone());
        }
        sort_by_start(&mut segments);

        Ok(TrialAnnotations {
            segments,
            active_version_id: Some(selected.id.clone()),
            versions: versions.iter().map(|v| v.meta_for(&self.user_id)).collect(),
        })
    }

    async fn list_versions(&self, key: &TrialKey) -> ApiResult<Vec<VersionMeta>> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;
        Ok(state
            .versions_for(key)
            .iter()
            .map(|v| v.meta_for(&self.user_id))
            .collect())
    }

    async fn sync(&self, key: &TrialKey, request: &SyncRequest) -> ApiResult<SyncResult> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.sync_calls += 1;
        state.gate()?;

        let now = Utc::now();
        let position = state
            .versions
            .iter()
            .position(|v| &v.key == key && v.user_id == self.user_id);

        if let Some(index) = position {
            if request.client_updated_at < state.versions[index].updated_at {
                return Err(ApiError::Conflict(
                    "a newer version exists on the server; reload before uploading".into(),
                ));
            }
        }

        let version_id = match position {
            Some(index) => state.versions[index].id.clone(),
            None => Uuid::new_v4().to_string(),
        };

        let segments: Vec<Segment> = request
            .segments
            .iter()
            .map(|segment| Segment {
                file_id: key.file_id.clone(),
                trial_index: key.trial_index,
                synced: false,
                user_id: Some(self.user_id.clone()),
                version_id: Some(version_id.clone()),
                ..segment.clone()
            })
            .collect();

        match position {
            Some(index) => {
                let version = &mut state.versions[index];
                version.segments = segments;
                version.status = request.status;
                version.username = self.username.clone();
                version.updated_at = now;
            }
            None => state.versions.push(StoredVersion {
                id: version_id.clone(),
                key: key.clone(),
                user_id: self.user_id.clone(),
                username: self.username.clone(),
                status: request.status,
                created_at: now,
                updated_at: now,
                segments,
            }),
        }

        Ok(SyncResult {
            version_id,
            status: request.status,
            segment_count: request.segments.len(),
            synced_at: now,
        })
    }

    async fn delete_version(&self, key: &TrialKey, version_id: &str) -> ApiResult<()> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;

        let index = state
            .versions
            .iter()
            .position(|v| v.id == version_id && &v.key == key)
            .ok_or_else(|| ApiError::NotFound(format!("version {version_id}")))?;

        if state.versions[index].user_id != self.user_id {
            return Err(ApiError::Server {
                status: 403,
                message: "only the owner may delete this version".into(),
            });
        }

        state.versions.remove(index);
        Ok(())
    }

    async fn create_segment(&self, payload: &NewSegment) -> ApiResult<Segment> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;

        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4().to_string(),
            file_id: payload.file_id.clone(),
            trial_index: payload.trial_index,
            phase_id: payload.phase_id.clone(),
            phase_name: payload.phase_name.clone(),
            start_time: payload.start_time,
            end_time: payload.end_time,
            start_index: payload.start_index,
            end_index: payload.end_index,
            event_index: payload.event_index,
            color: payload.color.clone(),
            label: payload.label.clone(),
            created_at: now,
            updated_at: now,
            synced: false,
            user_id: Some(self.user_id.clone()),
            version_id: None,
        };

        let key = TrialKey::new(payload.file_id.clone(), payload.trial_index);
        state.legacy.entry(key).or_default().push(segment.clone());
        Ok(segment)
    }

    async fn update_segment(&self, segment_id: &str, patch: &SegmentPatch) -> ApiResult<Segment> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;

        let segment = state
            .legacy
            .values_mut()
            .flat_map(|segments| segments.iter_mut())
            .find(|segment| segment.id == segment_id)
            .ok_or_else(|| ApiError::NotFound(format!("segment {segment_id}")))?;

        let mut updated = patch.apply_to(segment).map_err(|message| ApiError::Server {
            status: 422,
            message,
        })?;
        updated.updated_at = Utc::now();
        *segment = updated.clone();
        Ok(updated)
    }

    async fn delete_segment(&self, segment_id: &str) -> ApiResult<()> {
        self.backend.delay().await;
        let mut state = self.backend.lock();
        state.gate()?;

        for segments in state.legacy.values_mut() {
            if let Some(index) = segments.iter().position(|s| s.id == segment_id) {
                segments.remove(index);
                return Ok(());
            }
        }
        Err(ApiError::NotFound(format!("segment {segment_id}")))
    }
}
