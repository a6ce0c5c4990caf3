//! Session permissions supplied by the backend.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A single capability the backend can grant to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "publish-media")]
    PublishMedia,
    #[serde(rename = "publish-screen")]
    PublishScreen,
    #[serde(rename = "transient-data")]
    TransientData,
    #[serde(rename = "control")]
    SendControl,
    #[serde(rename = "hide-display-names")]
    HideDisplayNames,
}

/// The set of permissions attached to a session.
///
/// Until the backend explicitly assigns permissions, everything is allowed;
/// once a set has been supplied, only the listed capabilities remain.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    explicitly_set: bool,
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with an explicit list from the backend.
    pub fn assign(&mut self, permissions: impl IntoIterator<Item = Permission>) {
        self.explicitly_set = true;
        self.permissions = permissions.into_iter().collect();
    }

    pub fn has(&self, permission: Permission) -> bool {
        !self.explicitly_set || self.permissions.contains(&permission)
    }

    pub fn is_explicitly_set(&self) -> bool {
        self.explicitly_set
    }

    /// The explicit list, if one was assigned.
    pub fn as_list(&self) -> Option<Vec<Permission>> {
        if self.explicitly_set {
            let mut list: Vec<Permission> = self.permissions.iter().copied().collect();
            list.sort_by_key(|p| format!("{p:?}"));
            Some(list)
        } else {
            None
        }
    }
}
