//! `maestro instance` — instance lifecycle commands.
//!
//! Tool calls run as the role given by `--caller-role`; the default is
//! Top, so the operator gets full access unless scoped down.

use maestro_core::access;
use maestro_core::lifecycle::TerminationPolicy;
use maestro_core::models::InstanceRole;
use maestro_core::state::OrchestratorState;
use maestro_core::tools::ToolResult;
use serde_json::json;

use super::print_json;

fn print_result(result: &ToolResult) -> Result<(), String> {
    print_json(&serde_json::to_value(result).unwrap_or_default());
    if result.success {
        Ok(())
    } else {
        Err(result.error.clone().unwrap_or_else(|| "tool failed".to_string()))
    }
}

pub async fn spawn(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    role: &str,
    work_dir: &str,
    parent_id: Option<&str>,
    prompt: Option<&str>,
    workspace_mode: &str,
) -> Result<(), String> {
    let mut params = json!({
        "role": role,
        "workDir": work_dir,
        "workspaceMode": workspace_mode,
    });
    if let Some(pid) = parent_id {
        params["parentId"] = json!(pid);
    }
    if let Some(prompt) = prompt {
        params["prompt"] = json!(prompt);
    }
    let params = params.as_object().cloned().unwrap_or_default();
    let result = state
        .tools
        .spawn_instance(caller_role, &params)
        .await
        .map_err(|e| e.to_string())?;
    print_result(&result)
}

pub async fn send(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    id: &str,
    text: &str,
) -> Result<(), String> {
    let params = json!({ "instanceId": id, "text": text })
        .as_object()
        .cloned()
        .unwrap_or_default();
    let result = state
        .tools
        .send_to_instance(caller_role, &params)
        .await
        .map_err(|e| e.to_string())?;
    print_result(&result)
}

pub async fn read(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    id: &str,
    lines: u32,
) -> Result<(), String> {
    let params = json!({ "instanceId": id, "lines": lines })
        .as_object()
        .cloned()
        .unwrap_or_default();
    let result = state
        .tools
        .read_output(caller_role, &params)
        .await
        .map_err(|e| e.to_string())?;
    print_result(&result)
}

pub async fn terminate(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    id: &str,
    orphan: bool,
) -> Result<(), String> {
    access::check_leaf_access(caller_role).map_err(|e| e.to_string())?;
    let policy = if orphan {
        TerminationPolicy::Orphan
    } else {
        TerminationPolicy::Cascade
    };
    let instance = state
        .manager
        .terminate_with_policy(id, policy)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(&instance).unwrap_or_default());
    Ok(())
}

pub async fn list(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    role: Option<&str>,
    status: Option<&str>,
    parent_id: Option<&str>,
) -> Result<(), String> {
    let mut params = serde_json::Map::new();
    if let Some(role) = role {
        params.insert("role".to_string(), json!(role));
    }
    if let Some(status) = status {
        params.insert("status".to_string(), json!(status));
    }
    if let Some(pid) = parent_id {
        params.insert("parentId".to_string(), json!(pid));
    }
    let result = state
        .tools
        .list_instances(caller_role, &params)
        .await
        .map_err(|e| e.to_string())?;
    print_result(&result)
}

pub async fn progress(
    state: &OrchestratorState,
    caller_role: InstanceRole,
    id: &str,
) -> Result<(), String> {
    let params = json!({ "instanceId": id })
        .as_object()
        .cloned()
        .unwrap_or_default();
    let result = state
        .tools
        .get_progress(caller_role, &params)
        .await
        .map_err(|e| e.to_string())?;
    print_result(&result)
}
