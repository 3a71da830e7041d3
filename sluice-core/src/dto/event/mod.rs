//! Resource-change events

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of resource that changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pipeline,
    Activity,
    Account,
    Setting,
}

/// What happened to the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Notification emitted after a mutation has been persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub id: String,
    pub action: ChangeAction,
}

impl ResourceChange {
    pub fn new(kind: ResourceKind, id: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            kind,
            id: id.into(),
            action,
        }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {:?}", self.kind, self.id, self.action)
    }
}
