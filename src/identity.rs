//! Current-user collaborator. Authentication and permission evaluation live
//! elsewhere; the core only asks who is annotating and whether they may.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub username: Option<String>,
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserIdentity>;

    /// Opaque "may annotate" gate.
    fn may_annotate(&self) -> bool;
}

/// Fixed identity, for hosts that resolve the user once at startup.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user: Option<UserIdentity>,
    may_annotate: bool,
}

impl StaticIdentity {
    pub fn new(user_id: &str, username: Option<&str>) -> Self {
        Self {
            user: Some(UserIdentity {
                user_id: user_id.to_string(),
                username: username.map(str::to_string),
            }),
            may_annotate: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user: None,
            may_annotate: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.may_annotate = false;
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.user.clone()
    }

    fn may_annotate(&self) -> bool {
        self.may_annotate && self.user.is_some()
    }
}
