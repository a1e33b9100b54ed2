use async_trait::async_trait;
use serde::Serialize;

use crate::error::ValidationError;

/// Whether the current user may mutate the loaded segment set.
///
/// `ReadOnly -> Forking -> Owned` is the only way a non-owner starts
/// editing; `Forking` lasts while the copied set is persisted as a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Ownership {
    ReadOnly,
    Forking,
    Owned,
}

impl Ownership {
    pub fn from_owner_flag(is_owner: bool) -> Self {
        if is_owner {
            Ownership::Owned
        } else {
            Ownership::ReadOnly
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned)
    }

    /// Pure precondition of a fork: a trial is loaded, the version is
    /// read-only and the user may annotate at all.
    pub fn check_fork(&self, loaded: bool, may_annotate: bool) -> Result<(), ValidationError> {
        if !loaded {
            return Err(ValidationError::NotLoaded);
        }
        if !may_annotate {
            return Err(ValidationError::PermissionDenied);
        }
        match self {
            Ownership::ReadOnly => Ok(()),
            Ownership::Forking | Ownership::Owned => Err(ValidationError::ForkNotApplicable),
        }
    }

    pub fn require_owned(&self) -> Result<(), ValidationError> {
        if self.is_owned() {
            Ok(())
        } else {
            Err(ValidationError::ReadOnlyVersion)
        }
    }
}

/// Asked before a mutation on a read-only version turns into a personal
/// draft. How the answer is obtained (dialog, prompt, flag) is up to the
/// host.
#[async_trait]
pub trait ForkConfirmer: Send + Sync {
    async fn confirm_fork(&self, file_id: &str, trial_index: u32) -> bool;
}

/// Never forks implicitly.
pub struct DenyFork;

#[async_trait]
impl ForkConfirmer for DenyFork {
    async fn confirm_fork(&self, _file_id: &str, _trial_index: u32) -> bool {
        false
    }
}

/// Always forks; for non-interactive hosts and tests.
pub struct AutoFork;

#[async_trait]
impl ForkConfirmer for AutoFork {
    async fn confirm_fork(&self, _file_id: &str, _trial_index: u32) -> bool {
        true
    }
}
