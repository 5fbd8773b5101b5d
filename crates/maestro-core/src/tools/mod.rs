//! OrchestratorTools - the parameter-validated operation surface callers
//! (CLI, embedding hosts) invoke on behalf of an instance.
//!
//! Provides orchestration tools:
//!   1. spawnInstance     - Create a child instance
//!   2. sendToInstance    - Deliver text to an instance's session
//!   3. readOutput        - Capture recent session output
//!   4. terminateInstance - Terminate (cascade per config)
//!   5. listInstances     - Filtered instance listing
//!   6. getProgress       - Instance status plus live children
//!
//! Every tool is gated on the caller's role: Leaf instances are workers,
//! not coordinators, and are denied across the board. Parameters arrive as
//! loose JSON and are validated up front, reporting all missing fields at
//! once.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access;
use crate::error::OrchestratorError;
use crate::lifecycle::{CreateInstanceRequest, InstanceManager};
use crate::models::{InstanceFilter, InstanceRole, InstanceStatus, WorkspaceMode};
use crate::optimizer::Optimizer;

/// Result of a tool operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or_default()),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type Params = serde_json::Map<String, serde_json::Value>;

fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub struct OrchestratorTools {
    optimizer: Arc<Optimizer>,
}

impl OrchestratorTools {
    pub fn new(optimizer: Arc<Optimizer>) -> Self {
        Self { optimizer }
    }

    fn manager(&self) -> &Arc<InstanceManager> {
        self.optimizer.manager()
    }

    // ─── Tool 1: Spawn Instance ──────────────────────────────────────────

    /// Required: `role`, `workDir`. Optional: `parentId`, `prompt`,
    /// `workspaceMode`.
    pub async fn spawn_instance(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;
        access::validate_required(params, &["role", "workDir"])?;

        let role = access::validate_role(param_str(params, "role").unwrap_or_default())?;
        let workspace_mode = match param_str(params, "workspaceMode") {
            Some(mode) => access::validate_workspace_mode(mode)?,
            None => WorkspaceMode::Isolated,
        };

        let request = CreateInstanceRequest {
            role,
            work_dir: param_str(params, "workDir").unwrap_or_default().to_string(),
            initial_prompt: param_str(params, "prompt").map(String::from),
            parent_id: param_str(params, "parentId").map(String::from),
            workspace_mode,
        };

        info!("[Tools] spawnInstance role={}", role.as_str());
        let instance = self.optimizer.spawn_instance(request).await?;
        Ok(ToolResult::success(instance))
    }

    // ─── Tool 2: Send To Instance ────────────────────────────────────────

    /// Required: `instanceId`, `text`.
    pub async fn send_to_instance(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;
        access::validate_required(params, &["instanceId", "text"])?;

        let instance_id = param_str(params, "instanceId").unwrap_or_default();
        let text = param_str(params, "text").unwrap_or_default();
        self.manager().send_to_instance(instance_id, text).await?;
        Ok(ToolResult::success(serde_json::json!({
            "instanceId": instance_id,
            "delivered": true,
        })))
    }

    // ─── Tool 3: Read Output ─────────────────────────────────────────────

    /// Required: `instanceId`. Optional: `lines` (default 50).
    pub async fn read_output(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;
        access::validate_required(params, &["instanceId"])?;

        let instance_id = param_str(params, "instanceId").unwrap_or_default();
        let lines = params
            .get("lines")
            .and_then(|v| v.as_u64())
            .unwrap_or(50) as u32;
        let output = self.manager().read_output(instance_id, lines).await?;
        Ok(ToolResult::success(serde_json::json!({
            "instanceId": instance_id,
            "output": output,
        })))
    }

    // ─── Tool 4: Terminate Instance ──────────────────────────────────────

    /// Required: `instanceId`.
    pub async fn terminate_instance(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;
        access::validate_required(params, &["instanceId"])?;

        let instance_id = param_str(params, "instanceId").unwrap_or_default();
        info!("[Tools] terminateInstance {}", instance_id);
        let instance = self.manager().terminate_instance(instance_id).await?;
        Ok(ToolResult::success(instance))
    }

    // ─── Tool 5: List Instances ──────────────────────────────────────────

    /// Optional filters: `role`, `status`, `parentId`.
    pub async fn list_instances(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;

        let filter = InstanceFilter {
            role: match param_str(params, "role") {
                Some(role) => Some(access::validate_role(role)?),
                None => None,
            },
            status: match param_str(params, "status") {
                Some(status) => match InstanceStatus::from_str(status) {
                    Some(status) => Some(status),
                    None => {
                        return Ok(ToolResult::error(format!("Unknown status '{}'", status)))
                    }
                },
                None => None,
            },
            parent_id: param_str(params, "parentId").map(String::from),
        };

        let stream = self.manager().list_instances(filter);
        futures::pin_mut!(stream);
        let mut instances = Vec::new();
        while let Some(instance) = stream.next().await {
            instances.push(instance?);
        }
        Ok(ToolResult::success(instances))
    }

    // ─── Tool 6: Get Progress ────────────────────────────────────────────

    /// Required: `instanceId`. Reports the instance record plus its live
    /// children, the hierarchy view a coordinator polls while delegating.
    pub async fn get_progress(
        &self,
        caller_role: InstanceRole,
        params: &Params,
    ) -> Result<ToolResult, OrchestratorError> {
        access::check_leaf_access(caller_role)?;
        access::validate_required(params, &["instanceId"])?;

        let instance_id = param_str(params, "instanceId").unwrap_or_default();
        let instance = self.manager().get_instance(instance_id).await?;
        let children = self
            .manager()
            .instance_store()
            .children(instance_id)
            .await?;

        let active = children
            .iter()
            .filter(|c| c.status == InstanceStatus::Active)
            .count();
        Ok(ToolResult::success(serde_json::json!({
            "instance": instance,
            "children": children,
            "activeChildren": active,
        })))
    }
}
