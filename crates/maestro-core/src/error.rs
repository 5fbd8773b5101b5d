//! Core error type for the Maestro platform.
//!
//! `OrchestratorError` is used throughout the core domain (stores, lifecycle,
//! workflow engine). Validation, hierarchy, and permission failures reject
//! synchronously before any side effect; spawn and store failures are retried
//! with bounded backoff before becoming fatal for that one operation.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing required parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    #[error("Hierarchy error: {0}")]
    Hierarchy(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Spawn timed out after {attempts} readiness probes for instance {instance_id}")]
    SpawnTimeout { instance_id: String, attempts: u32 },

    #[error("Spawn failed: {0}")]
    SpawnFailure(String),

    #[error("Store persist error: {0}")]
    StorePersist(String),

    #[error("Action {action_index} in stage '{stage_id}' failed: {message}")]
    ActionExecution {
        stage_id: String,
        action_index: usize,
        message: String,
    },

    #[error("Stage '{stage_id}' timed out after {timeout_secs}s")]
    StageTimeout { stage_id: String, timeout_secs: u64 },

    #[error("Workflow too complex: nesting depth {depth} exceeds limit {max_depth}")]
    WorkflowTooComplex { depth: usize, max_depth: usize },

    #[error("Ambiguous transition in stage '{stage_id}': on_success resolves {count} control actions, expected exactly 1")]
    AmbiguousTransition { stage_id: String, count: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// True for failures the lifecycle layer retries with backoff before
    /// surfacing (transient store/transport trouble).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Transport(_))
    }
}
