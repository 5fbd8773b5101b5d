//! Instance record and its enums.
//!
//! An instance is a tracked unit of delegated work bound to one interactive
//! session. Role governs both spawn permission (a parent may only spawn one
//! level below itself) and access to the orchestration command surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authority level of an instance in the delegation hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// Root coordinator; delegates to Mid instances.
    Top,
    /// Mid-level supervisor; delegates to Leaf workers.
    Mid,
    /// Leaf worker; spawns nothing and may not call orchestration primitives.
    Leaf,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Mid => "mid",
            Self::Leaf => "leaf",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "top" => Some(Self::Top),
            "mid" => Some(Self::Mid),
            "leaf" => Some(Self::Leaf),
            _ => None,
        }
    }

    /// Depth in the hierarchy: Top = 0, Mid = 1, Leaf = 2.
    pub fn depth(&self) -> u8 {
        match self {
            Self::Top => 0,
            Self::Mid => 1,
            Self::Leaf => 2,
        }
    }
}

/// Whether an instance works in its own directory or a common one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    Isolated,
    Shared,
}

impl WorkspaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Shared => "shared",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "isolated" => Some(Self::Isolated),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created, session allocated, readiness probe not yet passed.
    Pending,
    /// Readiness probe passed; accepting prompts.
    Active,
    /// Released, by request or process exit. Terminal.
    Terminated,
    /// Unrecoverable transport error. Terminal.
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "terminated" => Some(Self::Terminated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// A tracked unit of delegated work with an assigned role and session.
///
/// Children are always derived by querying `parent_id`; the record never
/// carries a redundant child list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub role: InstanceRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub work_dir: String,
    pub workspace_mode: WorkspaceMode,
    /// Session handle, owned exclusively by the lifecycle manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        id: String,
        role: InstanceRole,
        parent_id: Option<String>,
        work_dir: String,
        workspace_mode: WorkspaceMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            parent_id,
            work_dir,
            workspace_mode,
            session_id: None,
            status: InstanceStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for instance listing. All fields are conjunctive; `None` matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<InstanceRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(role) = self.role {
            if instance.role != role {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_id {
            if instance.parent_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [InstanceRole::Top, InstanceRole::Mid, InstanceRole::Leaf] {
            assert_eq!(InstanceRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(InstanceRole::from_str("TOP"), Some(InstanceRole::Top));
        assert!(InstanceRole::from_str("manager").is_none());
    }

    #[test]
    fn test_filter_matches() {
        let mut inst = Instance::new(
            "i1".into(),
            InstanceRole::Mid,
            Some("parent".into()),
            "/tmp/w".into(),
            WorkspaceMode::Isolated,
        );
        inst.status = InstanceStatus::Active;

        assert!(InstanceFilter::default().matches(&inst));
        assert!(InstanceFilter {
            role: Some(InstanceRole::Mid),
            status: Some(InstanceStatus::Active),
            parent_id: Some("parent".into()),
        }
        .matches(&inst));
        assert!(!InstanceFilter {
            role: Some(InstanceRole::Leaf),
            ..Default::default()
        }
        .matches(&inst));
    }
}
