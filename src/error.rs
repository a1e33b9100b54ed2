//! Error taxonomy shared by the annotation, sync and viewport components.
//!
//! Nothing in here is fatal: every variant is recovered at the component
//! boundary and surfaced to the user as a transient message.

use thiserror::Error;

use crate::api::ApiError;

/// Rejected input or a mutation attempted from the wrong state. Never
/// leaves a partial change behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("end time {end} must be later than start time {start}; pick a later point")]
    EndBeforeStart { start: f64, end: f64 },

    #[error("selected range is too small to form a segment; pick an end further away")]
    RangeTooSmall,

    #[error("boundary contains non-finite values; reload the waveform and retry")]
    InvalidBoundary,

    #[error("no phases configured; add a phase before annotating")]
    NoPhases,

    #[error("this version belongs to another user and is read-only")]
    ReadOnlyVersion,

    #[error("finish or cancel the current event before leaving annotation mode")]
    PendingBoundary,

    #[error("leave annotation mode before switching versions")]
    AnnotatingLocked,

    #[error("annotation mode is not enabled")]
    NotAnnotating,

    #[error("no trial is loaded")]
    NotLoaded,

    #[error("segment {0} not found")]
    SegmentNotFound(String),

    #[error("event {0} not found")]
    EventNotFound(u32),

    #[error("version {0} not found on this trial")]
    VersionNotFound(String),

    #[error("phase {0} not found")]
    PhaseNotFound(String),

    #[error("invalid segment edit: {0}")]
    InvalidPatch(String),

    #[error("current user may not annotate")]
    PermissionDenied,

    #[error("creating a personal draft requires confirmation")]
    ForkNotConfirmed,

    #[error("current version is already editable")]
    ForkNotApplicable,
}

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("network error: {0}")]
    Network(#[from] ApiError),

    /// Multi-item delete that kept going after individual failures.
    #[error("{failed} of {total} deletions failed: {first_error}")]
    PartialFailure {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("local storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl AnnotationError {
    pub fn is_validation(&self) -> bool {
        matches!(self, AnnotationError::Validation(_))
    }
}

pub type AnnotationResult<T> = std::result::Result<T, AnnotationError>;
