//! Phase-boundary annotation of recorded waveforms: boundary capture,
//! per-user drafts with background sync, version reconciliation and a
//! viewport with zoom history and auto-pan.
//!
//! [`Workspace`] wires the components together for a host application.

pub mod annotation;
pub mod api;
pub mod db;
pub mod error;
pub mod identity;
pub mod phases;
pub mod settings;
pub mod sync;
pub mod utils;
pub mod viewport;
pub mod waveform;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use annotation::{
    AnnotationController, AnnotationSnapshot, BoundaryClick, ClickResult, ForkConfirmer,
    LoadOutcome,
};
use api::{AnnotationApi, HttpAnnotationApi};
use db::{
    models::{Draft, DraftStatus, SegmentPatch, TrialKey},
    Database,
};
use error::AnnotationResult;
use identity::IdentityProvider;
use phases::PhaseStore;
use settings::{AppSettings, SettingsStore, ViewportSettings};
use sync::{DraftSyncEngine, SyncOutcome, SyncPass, SyncTrigger, SyncWorker};
use viewport::{ViewportController, ViewportSnapshot, ZoomState};
use waveform::WaveformSource;

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "phasemark";

/// Installs `env_logger` at `Info`, overridable through `RUST_LOG`. Safe to
/// call more than once.
pub fn init_logging() {
    let initialized = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
    if initialized.is_err() {
        log::debug!("logger already initialized");
    }
}

/// One background or manual sync pass followed by reconciliation of the
/// loaded trial.
#[derive(Clone)]
struct SyncCoordinator {
    engine: DraftSyncEngine,
    controller: AnnotationController,
}

impl SyncCoordinator {
    async fn sync_all(&self) -> Vec<SyncOutcome> {
        let outcomes = self.engine.sync_all().await;
        self.reconcile(&outcomes).await;
        outcomes
    }

    async fn reconcile(&self, outcomes: &[SyncOutcome]) {
        if let Err(err) = self.controller.reconcile(outcomes).await {
            crate::log_warn!("Reconciling sync results failed: {}", err);
        }
    }
}

#[async_trait]
impl SyncPass for SyncCoordinator {
    async fn run_pass(&self, trigger: SyncTrigger) {
        if trigger == SyncTrigger::Opportunistic && self.controller.is_mid_event().await {
            crate::log_debug!("Skipping opportunistic sync while an event is open");
            return;
        }
        if !self.engine.has_pending().await {
            return;
        }
        let outcomes = self.sync_all().await;
        let failed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, SyncOutcome::Failed { .. }))
            .count();
        if failed > 0 {
            crate::log_warn!("{} of {} drafts failed to sync ({:?})", failed, outcomes.len(), trigger);
        }
    }
}

/// Draft entry for a review surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub id: String,
    pub trial: TrialKey,
    pub user_id: String,
    pub username: Option<String>,
    pub status: DraftStatus,
    pub segment_count: usize,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub in_flight: bool,
}

impl DraftSummary {
    fn from_draft(draft: Draft, in_flight: bool) -> Self {
        Self {
            trial: draft.trial_key(),
            segment_count: draft.segments.len(),
            id: draft.id,
            user_id: draft.user_id,
            username: draft.username,
            status: draft.status,
            updated_at: draft.updated_at,
            last_synced_at: draft.last_synced_at,
            error: draft.error,
            in_flight,
        }
    }
}

/// A click as seen by the host: the capture result plus the window the
/// viewport panned to, if it moved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceClick {
    pub result: ClickResult,
    pub panned_to: Option<ZoomState>,
}

pub struct Workspace {
    controller: AnnotationController,
    engine: DraftSyncEngine,
    viewport: ViewportController,
    waveforms: Arc<dyn WaveformSource>,
    coordinator: Arc<SyncCoordinator>,
    worker: Mutex<SyncWorker>,
    settings: AppSettings,
    settings_store: Option<SettingsStore>,
}

impl Workspace {
    pub fn new(
        db: Database,
        api: Arc<dyn AnnotationApi>,
        waveforms: Arc<dyn WaveformSource>,
        identity: Arc<dyn IdentityProvider>,
        settings: AppSettings,
    ) -> Self {
        let timeout = settings.sync.request_timeout();
        let engine = DraftSyncEngine::new(db.clone(), Arc::clone(&api), timeout);
        let controller =
            AnnotationController::new(api, engine.clone(), PhaseStore::new(db), identity, timeout);
        let coordinator = Arc::new(SyncCoordinator {
            engine: engine.clone(),
            controller: controller.clone(),
        });

        Self {
            controller,
            engine,
            viewport: ViewportController::new(settings.viewport.auto_pan()),
            waveforms,
            coordinator,
            worker: Mutex::new(SyncWorker::new()),
            settings,
            settings_store: None,
        }
    }

    /// Workspace backed by files under `data_dir` and the HTTP API named in
    /// its settings file.
    pub fn open(
        data_dir: &Path,
        waveforms: Arc<dyn WaveformSource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let settings_store = SettingsStore::new(data_dir.join("settings.json"))?;
        let settings = settings_store.get();
        let database = Database::new(data_dir.join("phasemark.sqlite3"))?;
        let api = HttpAnnotationApi::new(&settings.api, settings.sync.request_timeout())?;

        let mut workspace = Self::new(database, Arc::new(api), waveforms, identity, settings);
        workspace.settings_store = Some(settings_store);
        Ok(workspace)
    }

    pub fn with_fork_confirmer(mut self, confirmer: Arc<dyn ForkConfirmer>) -> Self {
        self.controller = self.controller.with_fork_confirmer(confirmer);
        self.coordinator = Arc::new(SyncCoordinator {
            engine: self.engine.clone(),
            controller: self.controller.clone(),
        });
        self
    }

    /// Restores persisted drafts and the phase template, flushes whatever
    /// is pending and starts the background sync loop.
    pub async fn start(&self) -> Result<()> {
        self.engine
            .set_target_status(self.settings.sync.target_status)
            .await;
        let restored = self.engine.restore().await?;
        self.controller.init().await?;

        if restored > 0 {
            self.coordinator.run_pass(SyncTrigger::Interval).await;
        }

        let mut worker = self.worker.lock().await;
        worker.start(Arc::clone(&self.coordinator), self.settings.sync.interval())?;
        crate::log_info!("Workspace ready ({} drafts restored)", restored);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.worker.lock().await.stop().await
    }

    pub fn controller(&self) -> &AnnotationController {
        &self.controller
    }

    pub fn viewport(&self) -> &ViewportController {
        &self.viewport
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub async fn snapshot(&self) -> AnnotationSnapshot {
        self.controller.snapshot().await
    }

    pub async fn viewport_snapshot(&self) -> ViewportSnapshot {
        self.viewport.snapshot().await
    }

    /// Fetches the waveform, resets the viewport to its initial window and
    /// loads the trial's annotations.
    pub async fn open_trial(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> AnnotationResult<LoadOutcome> {
        let waveform = self
            .waveforms
            .fetch(key)
            .await
            .with_context(|| format!("Failed to fetch waveform for {key}"))?;

        match waveform.extent() {
            Some(extent) => {
                self.viewport
                    .init(
                        extent,
                        self.settings.viewport.default_zoom_x,
                        self.settings.viewport.default_zoom_y,
                    )
                    .await;
            }
            None => self.viewport.clear().await,
        }
        self.controller
            .set_waveform(key.clone(), Arc::new(waveform))
            .await;
        self.controller.load(key, version_id).await
    }

    pub async fn close_trial(&self) {
        self.controller.clear().await;
        self.viewport.clear().await;
    }

    pub async fn update_viewport_settings(&self, settings: ViewportSettings) -> Result<()> {
        let settings = match &self.settings_store {
            Some(store) => store.update_viewport(settings)?,
            None => settings,
        };
        self.viewport.set_auto_pan(settings.auto_pan()).await;
        Ok(())
    }

    fn nudge_sync(&self, worker: &SyncWorker) {
        if self.settings.sync.opportunistic {
            worker.nudge();
        }
    }

    async fn after_edit(&self) {
        let worker = self.worker.lock().await;
        self.nudge_sync(&worker);
    }

    /// Click on the timeline at `time`. A committed segment pans the
    /// viewport when its event end nears the right edge.
    pub async fn boundary_click_at(&self, time: f64) -> AnnotationResult<WorkspaceClick> {
        let result = self.controller.boundary_click_at(time).await?;
        self.finish_click(result).await
    }

    pub async fn boundary_click(&self, click: BoundaryClick) -> AnnotationResult<WorkspaceClick> {
        let result = self.controller.boundary_click(click).await?;
        self.finish_click(result).await
    }

    async fn finish_click(&self, result: ClickResult) -> AnnotationResult<WorkspaceClick> {
        let panned_to = match &result {
            ClickResult::SegmentCreated { event, .. } => {
                let panned = self.viewport.follow_event_end(event.end_time).await;
                self.after_edit().await;
                panned
            }
            ClickResult::BoundarySet { .. } => None,
        };
        Ok(WorkspaceClick { result, panned_to })
    }

    pub async fn update_segment(
        &self,
        segment_id: &str,
        patch: SegmentPatch,
    ) -> AnnotationResult<()> {
        self.controller.update_segment(segment_id, patch).await?;
        self.after_edit().await;
        Ok(())
    }

    pub async fn delete_segment(&self, segment_id: &str) -> AnnotationResult<()> {
        let result = self.controller.delete_segment(segment_id).await;
        self.after_edit().await;
        result
    }

    pub async fn delete_event(&self, event_index: u32) -> AnnotationResult<usize> {
        let result = self.controller.delete_event(event_index).await;
        self.after_edit().await;
        result
    }

    pub async fn cancel_event(&self) -> AnnotationResult<usize> {
        let result = self.controller.cancel_event().await;
        self.after_edit().await;
        result
    }

    /// Syncs every pending draft now and reconciles the loaded trial.
    pub async fn sync_now(&self) -> Vec<SyncOutcome> {
        self.coordinator.sync_all().await
    }

    pub async fn sync_draft(&self, draft_id: &str) -> SyncOutcome {
        let outcome = self.engine.sync_draft(draft_id).await;
        self.coordinator
            .reconcile(std::slice::from_ref(&outcome))
            .await;
        outcome
    }

    /// Every local draft, most recently edited first.
    pub async fn drafts(&self) -> Vec<DraftSummary> {
        let mut summaries = Vec::new();
        for draft in self.engine.list().await {
            let in_flight = self.engine.is_in_flight(&draft.id).await;
            summaries.push(DraftSummary::from_draft(draft, in_flight));
        }
        summaries
    }

    /// Discards any draft from the review list. The loaded trial is
    /// reloaded when it belongs to the same trial.
    pub async fn discard_draft(&self, draft_id: &str) -> AnnotationResult<bool> {
        let trial = self.engine.get(draft_id).await.map(|draft| draft.trial_key());
        let removed = self.engine.discard(draft_id).await?;
        if trial.is_some() && trial == self.controller.current_trial().await {
            self.controller.reload().await?;
        }
        Ok(removed)
    }
}
