//! Contract for the remote annotation store, plus the two implementations
//! the crate ships: an HTTP client and an in-process backend.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{Segment, SegmentPatch, TrialKey, VersionMeta, VersionStatus};

pub mod error;
pub mod http;
pub mod memory;

pub use error::{ApiError, ApiResult};
pub use http::HttpAnnotationApi;
pub use memory::{MemoryAnnotationApi, MemoryBackend};

/// Response of `GET annotations(fileId, trialIndex, versionId?)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialAnnotations {
    #[serde(rename = "annotations", default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub versions: Vec<VersionMeta>,
    #[serde(default)]
    pub active_version_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub segments: Vec<Segment>,
    pub client_updated_at: DateTime<Utc>,
    pub status: VersionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub version_id: String,
    pub status: VersionStatus,
    pub segment_count: usize,
    pub synced_at: DateTime<Utc>,
}

/// Payload of the legacy per-segment create endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSegment {
    pub file_id: String,
    pub trial_index: u32,
    pub phase_id: String,
    pub phase_name: String,
    pub start_time: f64,
    pub end_time: f64,
    pub start_index: usize,
    pub end_index: usize,
    pub event_index: u32,
    pub color: Option<String>,
    pub label: Option<String>,
}

#[async_trait]
pub trait AnnotationApi: Send + Sync {
    async fn get_annotations(
        &self,
        key: &TrialKey,
        version_id: Option<&str>,
    ) -> ApiResult<TrialAnnotations>;

    async fn list_versions(&self, key: &TrialKey) -> ApiResult<Vec<VersionMeta>>;

    async fn sync(&self, key: &TrialKey, request: &SyncRequest) -> ApiResult<SyncResult>;

    async fn delete_version(&self, key: &TrialKey, version_id: &str) -> ApiResult<()>;

    // Legacy, non-versioned segment endpoints. Edits reach the server
    // through `sync`; only `delete_segment` is called by the controller.

    async fn create_segment(&self, segment: &NewSegment) -> ApiResult<Segment>;

    async fn update_segment(&self, segment_id: &str, patch: &SegmentPatch) -> ApiResult<Segment>;

    async fn delete_segment(&self, segment_id: &str) -> ApiResult<()>;
}

/// Bounds any API call; expiry is reported as `ApiError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ApiResult<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout(limit)),
    }
}
