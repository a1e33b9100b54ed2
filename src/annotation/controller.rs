//! Annotation set manager and version reconciliation.
//!
//! `AnnotationController` is the single serialized entry point for every
//! change to the live segment set. Local work runs under the state lock;
//! network calls run with the lock released and their results are applied
//! only if the trial they were issued for is still the loaded one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    api::{with_timeout, AnnotationApi, TrialAnnotations},
    db::models::{Draft, Phase, Segment, SegmentPatch, TrialKey, VersionMeta},
    error::{AnnotationError, AnnotationResult, ValidationError},
    identity::{IdentityProvider, UserIdentity},
    phases::{apply_edit, follow_phase, PhaseEdit, PhaseStore},
    sync::SyncOutcome,
    waveform::Waveform,
};
use crate::{log_debug, log_error, log_info, log_warn};

use super::{
    capture::{Boundary, BoundaryCapture, BoundaryClick, CaptureStatus, ClickPlan},
    events::{build_events, next_event_index, sort_segments, AnnotationEvent},
    ownership::{DenyFork, ForkConfirmer, Ownership},
};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark::annotation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    Applied,
    /// A newer load started while this one was in flight.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ClickResult {
    BoundarySet { boundary: Boundary },
    SegmentCreated {
        segment: Segment,
        event: AnnotationEvent,
        completes_event: bool,
    },
}

/// Read-only view of the controller for hosts and review surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSnapshot {
    pub trial: Option<TrialKey>,
    pub segments: Vec<Segment>,
    pub events: Vec<AnnotationEvent>,
    pub versions: Vec<VersionMeta>,
    pub active_version_id: Option<String>,
    pub ownership: Option<Ownership>,
    pub has_draft: bool,
    pub phases: Vec<Phase>,
    pub capture: CaptureStatus,
    pub current_phase_index: usize,
    pub current_event_index: u32,
    pub pending_boundary: Option<Boundary>,
    pub loading: bool,
    pub last_error: Option<String>,
}

struct LoadedTrial {
    key: TrialKey,
    segments: Vec<Segment>,
    versions: Vec<VersionMeta>,
    active_version_id: Option<String>,
    requested_version_id: Option<String>,
    ownership: Ownership,
    has_draft: bool,
}

impl LoadedTrial {
    fn resolve(
        key: TrialKey,
        requested_version_id: Option<String>,
        fetched: TrialAnnotations,
        draft: Option<Draft>,
    ) -> AnnotationResult<Self> {
        check_single_owner(&key, &fetched.versions)?;

        // No versions means the legacy unversioned set, implicitly owned.
        let active_is_owned = match &fetched.active_version_id {
            None => true,
            Some(id) => fetched
                .versions
                .iter()
                .any(|version| &version.id == id && version.is_owner),
        };

        let (mut segments, ownership, has_draft) = match draft {
            Some(draft) => (
                mark_synced(draft.segments, false),
                Ownership::Owned,
                true,
            ),
            None => (
                mark_synced(fetched.segments, true),
                Ownership::from_owner_flag(active_is_owned),
                false,
            ),
        };
        sort_segments(&mut segments);

        Ok(Self {
            key,
            segments,
            versions: fetched.versions,
            active_version_id: fetched.active_version_id,
            requested_version_id,
            ownership,
            has_draft,
        })
    }

    fn own_version(&self) -> Option<VersionMeta> {
        self.versions.iter().find(|version| version.is_owner).cloned()
    }
}

fn check_single_owner(key: &TrialKey, versions: &[VersionMeta]) -> AnnotationResult<()> {
    let owned = versions.iter().filter(|version| version.is_owner).count();
    if owned > 1 {
        return Err(AnnotationError::DataIntegrity(format!(
            "{owned} versions of {key} claim the current user as owner"
        )));
    }
    Ok(())
}

fn plan_click(
    state: &AnnotationState,
    click: BoundaryClick,
) -> AnnotationResult<(ClickPlan, TrialKey)> {
    let key = state.trial()?.key.clone();
    let waveform = state.waveform_for(&key);
    let plan = state
        .capture
        .plan_click(click, waveform.as_deref(), &state.phases)?;
    Ok((plan, key))
}

fn mark_synced(segments: Vec<Segment>, synced: bool) -> Vec<Segment> {
    segments
        .into_iter()
        .map(|segment| Segment { synced, ..segment })
        .collect()
}

/// Server-confirmed segments outside any version are the only ones with
/// their own delete endpoint; versioned ones go away with the next upload.
fn needs_remote_delete(segment: &Segment) -> bool {
    segment.synced && segment.version_id.is_none()
}

struct AnnotationState {
    trial: Option<LoadedTrial>,
    phases: Vec<Phase>,
    capture: BoundaryCapture,
    waveform: Option<(TrialKey, Arc<Waveform>)>,
    last_error: Option<String>,
    load_generation: u64,
    loading: bool,
}

impl AnnotationState {
    fn new() -> Self {
        Self {
            trial: None,
            phases: Vec::new(),
            capture: BoundaryCapture::new(),
            waveform: None,
            last_error: None,
            load_generation: 0,
            loading: false,
        }
    }

    fn trial(&self) -> Result<&LoadedTrial, ValidationError> {
        self.trial.as_ref().ok_or(ValidationError::NotLoaded)
    }

    fn trial_mut(&mut self) -> Result<&mut LoadedTrial, ValidationError> {
        self.trial.as_mut().ok_or(ValidationError::NotLoaded)
    }

    fn owned_trial(&self) -> Result<&LoadedTrial, ValidationError> {
        let trial = self.trial()?;
        trial.ownership.require_owned()?;
        Ok(trial)
    }

    fn waveform_for(&self, key: &TrialKey) -> Option<Arc<Waveform>> {
        self.waveform
            .as_ref()
            .filter(|(loaded, _)| loaded == key)
            .map(|(_, waveform)| Arc::clone(waveform))
    }
}

/// Segments removed from an event and the remote deletions that failed.
struct EventPurge {
    removed: usize,
    failed: usize,
    total_remote: usize,
    first_error: Option<String>,
}

#[derive(Clone)]
pub struct AnnotationController {
    state: Arc<Mutex<AnnotationState>>,
    api: Arc<dyn AnnotationApi>,
    engine: crate::sync::DraftSyncEngine,
    phase_store: PhaseStore,
    identity: Arc<dyn IdentityProvider>,
    confirmer: Arc<dyn ForkConfirmer>,
    request_timeout: Duration,
}

impl AnnotationController {
    pub fn new(
        api: Arc<dyn AnnotationApi>,
        engine: crate::sync::DraftSyncEngine,
        phase_store: PhaseStore,
        identity: Arc<dyn IdentityProvider>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(AnnotationState::new())),
            api,
            engine,
            phase_store,
            identity,
            confirmer: Arc::new(DenyFork),
            request_timeout,
        }
    }

    pub fn with_fork_confirmer(mut self, confirmer: Arc<dyn ForkConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    /// Loads and normalizes the persisted phase template. Must run once
    /// before annotating.
    pub async fn init(&self) -> AnnotationResult<Vec<Phase>> {
        let phases = self.phase_store.load().await?;
        let mut state = self.state.lock().await;
        state.capture.set_phase_index(0, phases.len());
        state.phases = phases.clone();
        log_info!("Phase template ready with {} phases", phases.len());
        Ok(phases)
    }

    async fn settle<T>(&self, action: &str, result: AnnotationResult<T>) -> AnnotationResult<T> {
        let mut state = self.state.lock().await;
        match &result {
            Ok(_) => state.last_error = None,
            Err(err) if err.is_validation() => {
                log_warn!("{} rejected: {}", action, err);
                state.last_error = Some(err.to_string());
            }
            Err(err) => {
                log_error!("{} failed: {}", action, err);
                state.last_error = Some(err.to_string());
            }
        }
        result
    }

    fn editor(&self) -> Result<UserIdentity, ValidationError> {
        if !self.identity.may_annotate() {
            return Err(ValidationError::PermissionDenied);
        }
        self.identity
            .current_user()
            .ok_or(ValidationError::PermissionDenied)
    }

    pub async fn snapshot(&self) -> AnnotationSnapshot {
        let state = self.state.lock().await;
        let trial = state.trial.as_ref();
        let segments = trial.map(|t| t.segments.clone()).unwrap_or_default();
        AnnotationSnapshot {
            trial: trial.map(|t| t.key.clone()),
            events: build_events(&segments),
            segments,
            versions: trial.map(|t| t.versions.clone()).unwrap_or_default(),
            active_version_id: trial.and_then(|t| t.active_version_id.clone()),
            ownership: trial.map(|t| t.ownership),
            has_draft: trial.map(|t| t.has_draft).unwrap_or(false),
            phases: state.phases.clone(),
            capture: state.capture.status(),
            current_phase_index: state.capture.phase_index(),
            current_event_index: state.capture.event_index(),
            pending_boundary: state.capture.pending(),
            loading: state.loading,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn events(&self) -> Vec<AnnotationEvent> {
        let state = self.state.lock().await;
        state
            .trial
            .as_ref()
            .map(|trial| build_events(&trial.segments))
            .unwrap_or_default()
    }

    pub async fn current_trial(&self) -> Option<TrialKey> {
        let state = self.state.lock().await;
        state.trial.as_ref().map(|trial| trial.key.clone())
    }

    pub async fn is_annotating(&self) -> bool {
        self.state.lock().await.capture.is_annotating()
    }

    /// True while a boundary waits for its end click.
    pub async fn is_mid_event(&self) -> bool {
        self.state.lock().await.capture.pending().is_some()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.state.lock().await.last_error = None;
    }

    pub async fn set_waveform(&self, key: TrialKey, waveform: Arc<Waveform>) {
        self.state.lock().await.waveform = Some((key, waveform));
    }

    /// Forgets the loaded trial. In-flight loads are dropped on arrival.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.load_generation += 1;
        state.loading = false;
        state.trial = None;
        state.waveform = None;
        state.capture = BoundaryCapture::new();
        state.last_error = None;
    }

    // Loading and versions

    pub async fn load(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> AnnotationResult<LoadOutcome> {
        let result = self.load_inner(key, version_id).await;
        self.settle("load", result).await
    }

    async fn load_inner(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> AnnotationResult<LoadOutcome> {
        let generation = {
            let mut state = self.state.lock().await;
            state.load_generation += 1;
            state.loading = true;
            state.load_generation
        };

        let fetched = with_timeout(
            self.request_timeout,
            self.api.get_annotations(key, version_id),
        )
        .await;
        let draft = match self.identity.current_user() {
            Some(user) => self.engine.draft_for(key, &user.user_id).await,
            None => None,
        };

        let mut state = self.state.lock().await;
        if state.load_generation != generation {
            log_debug!("Discarding stale load of {}", key);
            return Ok(LoadOutcome::Stale);
        }
        state.loading = false;

        let resolved = fetched
            .map_err(AnnotationError::from)
            .and_then(|fetched| {
                LoadedTrial::resolve(key.clone(), version_id.map(str::to_string), fetched, draft)
            });
        match resolved {
            Ok(trial) => {
                log_info!(
                    "Loaded {} ({} segments, {} versions, {:?}{})",
                    key,
                    trial.segments.len(),
                    trial.versions.len(),
                    trial.ownership,
                    if trial.has_draft { ", local draft" } else { "" }
                );
                let phase_count = state.phases.len();
                state.capture = BoundaryCapture::for_segments(&trial.segments);
                state.capture.set_phase_index(0, phase_count);
                state.trial = Some(trial);
                Ok(LoadOutcome::Applied)
            }
            Err(err) => {
                state.trial = None;
                state.capture = BoundaryCapture::new();
                Err(err)
            }
        }
    }

    async fn reload_inner(&self) -> AnnotationResult<LoadOutcome> {
        let (key, version_id) = {
            let state = self.state.lock().await;
            let trial = state.trial()?;
            (trial.key.clone(), trial.requested_version_id.clone())
        };
        self.load_inner(&key, version_id.as_deref()).await
    }

    pub async fn reload(&self) -> AnnotationResult<LoadOutcome> {
        let result = self.reload_inner().await;
        self.settle("reload", result).await
    }

    /// Switches the view to another version. Refused while annotating so an
    /// in-progress event cannot be lost.
    pub async fn select_version(&self, version_id: &str) -> AnnotationResult<LoadOutcome> {
        let result = self.select_version_inner(version_id).await;
        self.settle("select version", result).await
    }

    async fn select_version_inner(&self, version_id: &str) -> AnnotationResult<LoadOutcome> {
        let key = {
            let state = self.state.lock().await;
            if state.capture.is_annotating() {
                return Err(ValidationError::AnnotatingLocked.into());
            }
            let trial = state.trial()?;
            if !trial.versions.iter().any(|version| version.id == version_id) {
                return Err(ValidationError::VersionNotFound(version_id.to_string()).into());
            }
            trial.key.clone()
        };
        self.load_inner(&key, Some(version_id)).await
    }

    pub async fn refresh_versions(&self) -> AnnotationResult<Vec<VersionMeta>> {
        let result = self.refresh_versions_inner().await;
        self.settle("refresh versions", result).await
    }

    async fn refresh_versions_inner(&self) -> AnnotationResult<Vec<VersionMeta>> {
        let (key, generation) = {
            let state = self.state.lock().await;
            (state.trial()?.key.clone(), state.load_generation)
        };
        let versions = with_timeout(self.request_timeout, self.api.list_versions(&key)).await?;
        check_single_owner(&key, &versions)?;

        let mut state = self.state.lock().await;
        if state.load_generation != generation {
            return Ok(versions);
        }
        if let Some(trial) = state.trial.as_mut() {
            if !trial.has_draft && trial.ownership != Ownership::Forking {
                if let Some(active) = &trial.active_version_id {
                    let owned = versions
                        .iter()
                        .any(|version| &version.id == active && version.is_owner);
                    trial.ownership = Ownership::from_owner_flag(owned);
                }
            }
            trial.versions = versions.clone();
        }
        Ok(versions)
    }

    /// Deletes one of the current user's versions on the server, then
    /// reloads the trial.
    pub async fn delete_version(&self, version_id: &str) -> AnnotationResult<LoadOutcome> {
        let result = self.delete_version_inner(version_id).await;
        self.settle("delete version", result).await
    }

    async fn delete_version_inner(&self, version_id: &str) -> AnnotationResult<LoadOutcome> {
        self.editor()?;
        let key = {
            let state = self.state.lock().await;
            if state.capture.is_annotating() {
                return Err(ValidationError::AnnotatingLocked.into());
            }
            let trial = state.trial()?;
            let version = trial
                .versions
                .iter()
                .find(|version| version.id == version_id)
                .ok_or_else(|| ValidationError::VersionNotFound(version_id.to_string()))?;
            if !version.is_owner {
                return Err(ValidationError::ReadOnlyVersion.into());
            }
            trial.key.clone()
        };

        with_timeout(
            self.request_timeout,
            self.api.delete_version(&key, version_id),
        )
        .await?;
        log_info!("Deleted version {} of {}", version_id, key);
        self.load_inner(&key, None).await
    }

    // Annotation mode

    pub async fn enable_annotation(&self) -> AnnotationResult<()> {
        let result = self.enable_annotation_inner().await;
        self.settle("enable annotation", result).await
    }

    async fn enable_annotation_inner(&self) -> AnnotationResult<()> {
        self.editor()?;
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let trial = state.trial.as_ref().ok_or(ValidationError::NotLoaded)?;
        state.capture.enable(&trial.segments, state.phases.len())?;
        Ok(())
    }

    pub async fn disable_annotation(&self) -> AnnotationResult<()> {
        let result = {
            let mut state = self.state.lock().await;
            state.capture.disable().map_err(AnnotationError::from)
        };
        self.settle("disable annotation", result).await
    }

    /// Handles one timeline click. The second click of a pair creates a
    /// segment for the current phase; on a read-only version the fork
    /// confirmer decides whether a personal draft is created first.
    pub async fn boundary_click(&self, click: BoundaryClick) -> AnnotationResult<ClickResult> {
        let result = self.boundary_click_inner(click).await;
        self.settle("boundary click", result).await
    }

    async fn boundary_click_inner(&self, click: BoundaryClick) -> AnnotationResult<ClickResult> {
        let user = self.editor()?;
        let (plan, key, generation) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let (plan, key) = plan_click(state, click)?;
            if let ClickPlan::Start(boundary) = plan {
                state.capture.commit(&plan);
                log_debug!("Pending boundary at {} (sample {})", boundary.time, boundary.index);
                return Ok(ClickResult::BoundarySet { boundary });
            }
            if state.trial()?.ownership != Ownership::ReadOnly {
                return self.create_segment(state, &user, &key, plan).await;
            }
            (plan, key, state.load_generation)
        };

        // The confirmer may prompt the user or read controller state, so it
        // runs without the lock and the click is re-planned afterwards.
        if !self
            .confirmer
            .confirm_fork(&key.file_id, key.trial_index)
            .await
        {
            return Err(ValidationError::ReadOnlyVersion.into());
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let (replanned, current_key) = plan_click(state, click)?;
        if state.load_generation != generation || current_key != key || replanned != plan {
            log_warn!("Trial changed while the fork was being confirmed; click dropped");
            return Err(ValidationError::ReadOnlyVersion.into());
        }
        if state.trial()?.ownership == Ownership::ReadOnly {
            self.fork_in_place(state, &user).await?;
        }
        self.create_segment(state, &user, &key, plan).await
    }

    async fn create_segment(
        &self,
        state: &mut AnnotationState,
        user: &UserIdentity,
        key: &TrialKey,
        plan: ClickPlan,
    ) -> AnnotationResult<ClickResult> {
        state.owned_trial()?;
        let ClickPlan::Segment {
            span,
            completes_event,
            ..
        } = plan.clone()
        else {
            return Err(AnnotationError::DataIntegrity(
                "segment click planned as a start boundary".into(),
            ));
        };

        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4().to_string(),
            file_id: key.file_id.clone(),
            trial_index: key.trial_index,
            phase_id: span.phase_id,
            phase_name: span.phase_name,
            start_time: span.start.time,
            end_time: span.end.time,
            start_index: span.start.index,
            end_index: span.end.index,
            event_index: span.event_index,
            color: span.color,
            label: None,
            created_at: now,
            updated_at: now,
            synced: false,
            user_id: Some(user.user_id.clone()),
            version_id: None,
        };

        let mut segments = state.trial()?.segments.clone();
        segments.push(segment.clone());
        sort_segments(&mut segments);
        self.stage_segments(state, user, segments).await?;
        state.capture.commit(&plan);

        let event = build_events(&state.trial()?.segments)
            .into_iter()
            .find(|event| event.event_index == segment.event_index)
            .ok_or_else(|| {
                AnnotationError::DataIntegrity(format!(
                    "event {} missing after commit",
                    segment.event_index
                ))
            })?;
        log_debug!(
            "Created {} segment [{}, {}] in event {}",
            segment.phase_name,
            segment.start_time,
            segment.end_time,
            segment.event_index
        );

        Ok(ClickResult::SegmentCreated {
            segment,
            event,
            completes_event,
        })
    }

    /// Click at `time` on the loaded waveform, snapped to its nearest
    /// sample.
    pub async fn boundary_click_at(&self, time: f64) -> AnnotationResult<ClickResult> {
        let click = {
            let state = self.state.lock().await;
            let waveform = state
                .trial
                .as_ref()
                .and_then(|trial| state.waveform_for(&trial.key));
            match waveform {
                Some(waveform) => BoundaryClick::snapped(time, &waveform),
                None => BoundaryClick::new(time, 0.0),
            }
        };
        self.boundary_click(click).await
    }

    pub async fn advance_phase(&self) -> AnnotationResult<()> {
        let result = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let segments = state
                .trial
                .as_ref()
                .map(|trial| trial.segments.as_slice())
                .unwrap_or_default();
            state
                .capture
                .advance_phase(segments, state.phases.len())
                .map_err(AnnotationError::from)
        };
        self.settle("advance phase", result).await
    }

    /// Returns false when no phase carries `key`; that is not an error.
    pub async fn select_phase_by_shortcut(&self, key: char) -> AnnotationResult<bool> {
        let result = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            Ok(state.capture.select_by_shortcut(key, &state.phases))
        };
        self.settle("select phase", result).await
    }

    pub async fn set_current_phase_index(&self, index: usize) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.capture.set_phase_index(index, state.phases.len());
    }

    // Segment edits

    pub async fn update_segment(
        &self,
        segment_id: &str,
        patch: SegmentPatch,
    ) -> AnnotationResult<Segment> {
        let result = self.update_segment_inner(segment_id, patch).await;
        self.settle("update segment", result).await
    }

    async fn update_segment_inner(
        &self,
        segment_id: &str,
        patch: SegmentPatch,
    ) -> AnnotationResult<Segment> {
        let user = self.editor()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let trial = state.owned_trial()?;

        let current = trial
            .segments
            .iter()
            .find(|segment| segment.id == segment_id)
            .ok_or_else(|| ValidationError::SegmentNotFound(segment_id.to_string()))?;
        let mut updated = patch
            .apply_to(current)
            .map_err(ValidationError::InvalidPatch)?;
        updated.updated_at = Utc::now();

        let mut segments: Vec<Segment> = trial
            .segments
            .iter()
            .map(|segment| {
                if segment.id == segment_id {
                    updated.clone()
                } else {
                    segment.clone()
                }
            })
            .collect();
        sort_segments(&mut segments);
        self.stage_segments(state, &user, segments).await?;
        updated.synced = false;
        Ok(updated)
    }

    /// Removes one segment. A server-confirmed legacy segment is also
    /// deleted remotely; a failure there is reported but the local removal
    /// stands.
    pub async fn delete_segment(&self, segment_id: &str) -> AnnotationResult<()> {
        let result = self.delete_segment_inner(segment_id).await;
        self.settle("delete segment", result).await
    }

    async fn delete_segment_inner(&self, segment_id: &str) -> AnnotationResult<()> {
        let user = self.editor()?;
        let removed = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let trial = state.owned_trial()?;
            let removed = trial
                .segments
                .iter()
                .find(|segment| segment.id == segment_id)
                .cloned()
                .ok_or_else(|| ValidationError::SegmentNotFound(segment_id.to_string()))?;
            let remaining: Vec<Segment> = trial
                .segments
                .iter()
                .filter(|segment| segment.id != segment_id)
                .cloned()
                .collect();
            self.stage_segments(state, &user, remaining).await?;
            removed
        };

        if needs_remote_delete(&removed) {
            with_timeout(self.request_timeout, self.api.delete_segment(&removed.id)).await?;
        }
        Ok(())
    }

    /// Removes every segment of one event. Remote deletions are attempted
    /// one by one; failed ones stay in the set and are reported together.
    pub async fn delete_event(&self, event_index: u32) -> AnnotationResult<usize> {
        let result = self.delete_event_inner(event_index).await;
        self.settle("delete event", result).await
    }

    async fn delete_event_inner(&self, event_index: u32) -> AnnotationResult<usize> {
        let user = self.editor()?;
        let purge = self.purge_event(&user, event_index, false).await?;
        purge_result(purge)
    }

    /// Abandons the event being captured: its segments are removed and the
    /// flow restarts at phase 0 of the next free event. Annotation mode
    /// stays on.
    pub async fn cancel_event(&self) -> AnnotationResult<usize> {
        let result = self.cancel_event_inner().await;
        self.settle("cancel event", result).await
    }

    async fn cancel_event_inner(&self) -> AnnotationResult<usize> {
        let event_index = {
            let state = self.state.lock().await;
            if !state.capture.is_annotating() {
                return Err(ValidationError::NotAnnotating.into());
            }
            state.capture.event_index()
        };

        let has_segments = {
            let state = self.state.lock().await;
            state
                .trial()?
                .segments
                .iter()
                .any(|segment| segment.event_index == event_index)
        };
        let purge = if has_segments {
            let user = self.editor()?;
            Some(self.purge_event(&user, event_index, true).await?)
        } else {
            None
        };

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let next = state
                .trial
                .as_ref()
                .map(|trial| next_event_index(&trial.segments))
                .unwrap_or(0);
            state.capture.reset_flow(next);
        }

        match purge {
            Some(purge) => purge_result(purge),
            None => Ok(0),
        }
    }

    async fn purge_event(
        &self,
        user: &UserIdentity,
        event_index: u32,
        allow_empty: bool,
    ) -> AnnotationResult<EventPurge> {
        let (generation, remote) = {
            let state = self.state.lock().await;
            let trial = state.owned_trial()?;
            let members: Vec<&Segment> = trial
                .segments
                .iter()
                .filter(|segment| segment.event_index == event_index)
                .collect();
            if members.is_empty() && !allow_empty {
                return Err(ValidationError::EventNotFound(event_index).into());
            }
            let remote: Vec<Segment> = members
                .into_iter()
                .filter(|segment| needs_remote_delete(segment))
                .cloned()
                .collect();
            (state.load_generation, remote)
        };

        let mut failed_ids = Vec::new();
        let mut first_error = None;
        for segment in &remote {
            let outcome =
                with_timeout(self.request_timeout, self.api.delete_segment(&segment.id)).await;
            if let Err(err) = outcome {
                log_warn!("Remote delete of segment {} failed: {}", segment.id, err);
                first_error.get_or_insert_with(|| err.to_string());
                failed_ids.push(segment.id.clone());
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.load_generation != generation {
            log_warn!("Trial changed while deleting event {}; local state untouched", event_index);
            return Ok(EventPurge {
                removed: 0,
                failed: failed_ids.len(),
                total_remote: remote.len(),
                first_error,
            });
        }

        let trial = state.owned_trial()?;
        let before = trial.segments.len();
        let remaining: Vec<Segment> = trial
            .segments
            .iter()
            .filter(|segment| {
                segment.event_index != event_index || failed_ids.contains(&segment.id)
            })
            .cloned()
            .collect();
        let removed = before - remaining.len();
        if removed > 0 {
            self.stage_segments(state, user, remaining).await?;
        }

        Ok(EventPurge {
            removed,
            failed: failed_ids.len(),
            total_remote: remote.len(),
            first_error,
        })
    }

    // Drafts and ownership

    /// Writes `segments` as the user's draft for the loaded trial and makes
    /// them the live set, all marked unsynced.
    async fn stage_segments(
        &self,
        state: &mut AnnotationState,
        user: &UserIdentity,
        segments: Vec<Segment>,
    ) -> AnnotationResult<()> {
        let trial = state.trial_mut()?;
        let draft = self
            .engine
            .stage(&trial.key, user, segments, trial.own_version())
            .await?;
        trial.segments = draft.segments;
        trial.has_draft = true;
        Ok(())
    }

    async fn fork_in_place(
        &self,
        state: &mut AnnotationState,
        user: &UserIdentity,
    ) -> AnnotationResult<()> {
        let trial = state.trial_mut()?;
        trial
            .ownership
            .check_fork(true, self.identity.may_annotate())?;
        trial.ownership = Ownership::Forking;

        let segments = trial.segments.clone();
        match self
            .engine
            .stage(&trial.key, user, segments, trial.own_version())
            .await
        {
            Ok(draft) => {
                log_info!("Forked {} into draft {}", trial.key, draft.id);
                trial.segments = draft.segments;
                trial.has_draft = true;
                trial.ownership = Ownership::Owned;
                Ok(())
            }
            Err(err) => {
                trial.ownership = Ownership::ReadOnly;
                Err(err.into())
            }
        }
    }

    /// Copies the viewed read-only set into a personal draft and reloads,
    /// after which the draft is the editable view. `confirmed` is the
    /// host's answer to the fork prompt.
    pub async fn fork_to_draft(&self, confirmed: bool) -> AnnotationResult<LoadOutcome> {
        let result = self.fork_to_draft_inner(confirmed).await;
        self.settle("fork to draft", result).await
    }

    async fn fork_to_draft_inner(&self, confirmed: bool) -> AnnotationResult<LoadOutcome> {
        let user = self.editor()?;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let loaded = state.trial.is_some();
            let ownership = state
                .trial
                .as_ref()
                .map(|trial| trial.ownership)
                .unwrap_or(Ownership::ReadOnly);
            ownership.check_fork(loaded, true)?;
            if !confirmed {
                return Err(ValidationError::ForkNotConfirmed.into());
            }
            self.fork_in_place(state, &user).await?;
        }
        self.reload_inner().await
    }

    /// Drops the user's draft for the loaded trial and shows the server
    /// state again.
    pub async fn discard_draft(&self) -> AnnotationResult<LoadOutcome> {
        let result = self.discard_draft_inner().await;
        self.settle("discard draft", result).await
    }

    async fn discard_draft_inner(&self) -> AnnotationResult<LoadOutcome> {
        let user = self
            .identity
            .current_user()
            .ok_or(ValidationError::PermissionDenied)?;
        let key = {
            let state = self.state.lock().await;
            if state.capture.pending().is_some() {
                return Err(ValidationError::PendingBoundary.into());
            }
            state.trial()?.key.clone()
        };
        let id = crate::db::models::draft_id(&key.file_id, key.trial_index, &user.user_id);
        self.engine.discard(&id).await?;
        self.reload_inner().await
    }

    /// Applies sync results to the live set. When the loaded trial's draft
    /// was synced away and the user is not annotating, the trial is
    /// reloaded so the view shows the canonical server version. Returns
    /// whether a reload happened.
    pub async fn reconcile(&self, outcomes: &[SyncOutcome]) -> AnnotationResult<bool> {
        let result = self.reconcile_inner(outcomes).await;
        match result {
            Ok(false) => Ok(false),
            other => self.settle("reconcile", other).await,
        }
    }

    async fn reconcile_inner(&self, outcomes: &[SyncOutcome]) -> AnnotationResult<bool> {
        let Some(user) = self.identity.current_user() else {
            return Ok(false);
        };
        let reload = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let annotating = state.capture.is_annotating();
            let Some(trial) = state.trial.as_mut() else {
                return Ok(false);
            };

            let synced_version = outcomes.iter().find_map(|outcome| match outcome {
                SyncOutcome::Synced {
                    key,
                    user_id,
                    result,
                    ..
                } if key == &trial.key && user_id == &user.user_id => {
                    Some(result.version_id.clone())
                }
                _ => None,
            });
            let Some(version_id) = synced_version else {
                return Ok(false);
            };
            if self.engine.draft_for(&trial.key, &user.user_id).await.is_some() {
                log_debug!(
                    "Trial {} was edited after version {} was uploaded; keeping the draft",
                    trial.key,
                    version_id
                );
                return Ok(false);
            }

            trial.has_draft = false;
            trial.active_version_id = Some(version_id.clone());
            for segment in &mut trial.segments {
                segment.synced = true;
                segment.version_id = Some(version_id.clone());
            }
            log_info!("Draft for {} synced as version {}", trial.key, version_id);

            if annotating {
                None
            } else {
                Some((trial.key.clone(), version_id))
            }
        };

        match reload {
            Some((key, version_id)) => {
                self.load_inner(&key, Some(&version_id)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Phase template

    pub async fn phases(&self) -> Vec<Phase> {
        self.state.lock().await.phases.clone()
    }

    /// Edits the phase template. Refused while a boundary is pending; the
    /// current phase index follows the selected phase.
    pub async fn edit_phases(&self, edit: PhaseEdit) -> AnnotationResult<Vec<Phase>> {
        let result = self.edit_phases_inner(edit).await;
        self.settle("edit phases", result).await
    }

    async fn edit_phases_inner(&self, edit: PhaseEdit) -> AnnotationResult<Vec<Phase>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.capture.pending().is_some() {
            return Err(ValidationError::PendingBoundary.into());
        }

        let next = apply_edit(&state.phases, edit)?;
        self.phase_store.save(&next).await?;
        let index = follow_phase(&state.phases, &next, state.capture.phase_index());
        state.capture.set_phase_index(index, next.len());
        state.phases = next.clone();
        Ok(next)
    }
}

fn purge_result(purge: EventPurge) -> AnnotationResult<usize> {
    match purge.first_error {
        Some(first_error) => Err(AnnotationError::PartialFailure {
            failed: purge.failed,
            total: purge.total_remote,
            first_error,
        }),
        None => Ok(purge.removed),
    }
}
