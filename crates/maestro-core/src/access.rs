//! Stateless permission and shape checks.
//!
//! Every orchestration entry point runs through these before touching the
//! store or the transport, so rejections never leave partial state behind.

use crate::error::OrchestratorError;
use crate::models::{InstanceRole, WorkspaceMode};

/// Parse a role string, rejecting unknown values.
pub fn validate_role(role: &str) -> Result<InstanceRole, OrchestratorError> {
    InstanceRole::from_str(role).ok_or_else(|| {
        OrchestratorError::Validation(format!(
            "Unknown role '{}'. Expected one of: top, mid, leaf",
            role
        ))
    })
}

/// Parse a workspace mode string, rejecting unknown values.
pub fn validate_workspace_mode(mode: &str) -> Result<WorkspaceMode, OrchestratorError> {
    WorkspaceMode::from_str(mode).ok_or_else(|| {
        OrchestratorError::Validation(format!(
            "Unknown workspace mode '{}'. Expected 'isolated' or 'shared'",
            mode
        ))
    })
}

/// Leaf workers execute; they do not orchestrate. Any orchestration
/// primitive invoked by a Leaf-role caller is rejected here.
pub fn check_leaf_access(caller_role: InstanceRole) -> Result<(), OrchestratorError> {
    if caller_role == InstanceRole::Leaf {
        return Err(OrchestratorError::PermissionDenied(
            "Leaf instances may not invoke orchestration primitives".to_string(),
        ));
    }
    Ok(())
}

/// Check that `params` carries every field in `required`, reporting *all*
/// missing fields at once rather than failing on the first.
pub fn validate_required(
    params: &serde_json::Map<String, serde_json::Value>,
    required: &[&str],
) -> Result<(), OrchestratorError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|f| {
            !params.contains_key(**f) || params.get(**f).map(|v| v.is_null()).unwrap_or(true)
        })
        .map(|f| f.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::MissingParameters(missing))
    }
}

/// Enforce the parent→child role step: a parent may only spawn the role
/// exactly one level below its own. `allow_skip_level` additionally permits
/// Top → Leaf (a deliberate configuration escape hatch, off by default).
pub fn validate_hierarchy(
    parent_role: Option<InstanceRole>,
    child_role: InstanceRole,
    allow_skip_level: bool,
) -> Result<(), OrchestratorError> {
    match parent_role {
        // Only a Top instance may be created without a parent.
        None => {
            if child_role == InstanceRole::Top {
                Ok(())
            } else {
                Err(OrchestratorError::Hierarchy(format!(
                    "A {} instance requires a parent",
                    child_role.as_str()
                )))
            }
        }
        Some(parent) => {
            let step_ok = child_role.depth() == parent.depth() + 1;
            let skip_ok = allow_skip_level
                && parent == InstanceRole::Top
                && child_role == InstanceRole::Leaf;
            if step_ok || skip_ok {
                Ok(())
            } else {
                Err(OrchestratorError::Hierarchy(format!(
                    "A {} instance may not spawn a {} instance",
                    parent.as_str(),
                    child_role.as_str()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceRole::*;

    #[test]
    fn test_validate_role() {
        assert_eq!(validate_role("mid").unwrap(), Mid);
        assert!(matches!(
            validate_role("boss"),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_leaf_access_denied() {
        assert!(check_leaf_access(Top).is_ok());
        assert!(check_leaf_access(Mid).is_ok());
        assert!(matches!(
            check_leaf_access(Leaf),
            Err(OrchestratorError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_validate_required_reports_all_missing() {
        let params = serde_json::json!({
            "role": "mid",
            "nulled": null,
        });
        let map = params.as_object().unwrap();
        let err = validate_required(map, &["role", "workDir", "prompt", "nulled"]).unwrap_err();
        match err {
            OrchestratorError::MissingParameters(missing) => {
                assert_eq!(missing, vec!["workDir", "prompt", "nulled"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_hierarchy_adjacent_pairs() {
        // Every valid adjacent pair succeeds.
        assert!(validate_hierarchy(Some(Top), Mid, false).is_ok());
        assert!(validate_hierarchy(Some(Mid), Leaf, false).is_ok());
        assert!(validate_hierarchy(None, Top, false).is_ok());

        // Non-adjacent, reversed, and self pairs all fail.
        for (parent, child) in [
            (Top, Leaf),
            (Top, Top),
            (Mid, Top),
            (Mid, Mid),
            (Leaf, Top),
            (Leaf, Mid),
            (Leaf, Leaf),
        ] {
            assert!(
                matches!(
                    validate_hierarchy(Some(parent), child, false),
                    Err(OrchestratorError::Hierarchy(_))
                ),
                "{:?} -> {:?} should be rejected",
                parent,
                child
            );
        }

        // Parentless non-Top is rejected.
        assert!(validate_hierarchy(None, Leaf, false).is_err());
    }

    #[test]
    fn test_hierarchy_skip_level_flag() {
        assert!(validate_hierarchy(Some(Top), Leaf, true).is_ok());
        // The flag never relaxes anything else.
        assert!(validate_hierarchy(Some(Mid), Top, true).is_err());
        assert!(validate_hierarchy(Some(Leaf), Leaf, true).is_err());
    }
}
