//! YAML schema types for workflow definitions.
//!
//! A workflow YAML drives one instance through a stage graph:
//!
//! ```yaml
//! name: "review-loop"
//! version: "1.0"
//!
//! settings:
//!   poll_interval_secs: 2
//!   timeout_secs: 120
//!   default_role: leaf
//!   default_workspace_mode: isolated
//!   blank_stage: blank
//!
//! fragments:
//!   notify:
//!     - action: log
//!       message: "stage done: ${matched_trigger}"
//!
//! stages:
//!   - id: compare
//!     prompt: "Compare the branches and report COMPARE_FINISHED"
//!     trigger_keyword: "COMPARE_FINISHED"
//!     on_success:
//!       - action: fragment
//!         fragment: notify
//!       - action: next_stage
//!         stage: commit
//!   - id: commit
//!     prompt: "Commit the result and report COMMIT_FINISHED"
//!     trigger_keyword: "COMMIT_FINISHED|COMMIT_FAILED"
//!     on_success:
//!       - action: return_to_blank_state
//!   - id: blank
//!     prompt: ""
//!     trigger_keyword: "NEW_TASK"
//!     on_success:
//!       - action: next_stage
//!         stage: compare
//! ```
//!
//! Definitions are immutable once loaded: `from_yaml_str` resolves fragment
//! aliases and `validate` rejects malformed graphs before the engine ever
//! sees them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub settings: Settings,

    /// Reusable action fragments, aliased via `action: fragment` and
    /// resolved before execution.
    #[serde(default)]
    pub fragments: HashMap<String, Vec<Action>>,

    /// Ordered stage collection; the first stage is the entry point.
    pub stages: Vec<Stage>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Workflow-level settings with per-stage overrides where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds between trigger polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Default stage timeout in seconds (stages may override).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Role used by `spawn` actions that leave it unset.
    #[serde(default = "default_role")]
    pub default_role: String,

    /// Workspace mode used by `spawn` actions that leave it unset.
    #[serde(default = "default_workspace_mode")]
    pub default_workspace_mode: String,

    /// The designated idle stage `return_to_blank_state` jumps to.
    /// Defaults to the entry stage.
    #[serde(default)]
    pub blank_stage: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_timeout(),
            default_role: default_role(),
            default_workspace_mode: default_workspace_mode(),
            blank_stage: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    2
}

fn default_timeout() -> u64 {
    300
}

fn default_role() -> String {
    "leaf".to_string()
}

fn default_workspace_mode() -> String {
    "isolated".to_string()
}

/// One step of the workflow: a prompt, a completion trigger, and the action
/// lists run on trigger match (success) or timeout (failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,

    /// Prompt template, rendered against the execution context.
    pub prompt: String,

    /// Literal text or `|`-alternation watched for in captured output.
    pub trigger_keyword: String,

    /// Per-stage timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub on_success: Vec<Action>,

    #[serde(default)]
    pub on_failure: Vec<Action>,
}

/// What to do when an external call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the surrounding stage.
    #[default]
    Abort,
    /// Record the failure in the bound result and proceed.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Item source for `foreach`: an inline list or a context expression that
/// must resolve to an array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemsSource {
    List(Vec<serde_json::Value>),
    Expr(String),
}

/// The closed action vocabulary. Every variant carries only its own
/// parameters; `bind` fields name the context key a result lands under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Send a prompt to the stage's instance (or a named one), optionally
    /// awaiting a keyword with its own timeout before continuing.
    SendPrompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        await_keyword: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        await_timeout_secs: Option<u64>,
    },

    /// Run a shell command, capturing stdout/stderr/exit code.
    RunScript {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        on_failure: OnFailure,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// Issue an HTTP request, capturing status and body.
    HttpRequest {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        on_failure: OnFailure,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// Evaluate a boolean expression over the context and execute exactly
    /// one branch.
    Conditional {
        condition: String,
        #[serde(default)]
        then: Vec<Action>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Action>,
    },

    /// Run branches concurrently with isolated context copies, merged in
    /// declaration order once the group completes.
    Parallel {
        branches: Vec<Vec<Action>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
        #[serde(default = "default_true")]
        wait_all: bool,
    },

    /// Sequential iteration with a per-iteration binding.
    Foreach {
        items: ItemsSource,
        #[serde(default = "default_bind_as")]
        bind_as: String,
        body: Vec<Action>,
    },

    /// Render a template into a context binding. Pure data shaping.
    Template { template: String, bind: String },

    /// Write rendered content to a file.
    SaveFile { path: String, content: String },

    /// Structured log line.
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },

    /// Create an instance through the optimizer, binding its id.
    Spawn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        work_dir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_mode: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// Terminate an instance by id expression.
    Terminate { instance: String },

    /// Control transfer: jump to a named stage.
    NextStage { stage: String },

    /// Control transfer: back to the designated idle stage, clearing
    /// run-scoped context. An ordinary edge, not a terminal state.
    ReturnToBlankState,

    /// Control transfer: finish the run successfully.
    CompleteWorkflow,

    /// Load-time alias for a named fragment; never reaches the engine.
    Fragment { fragment: String },
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bind_as() -> String {
    "item".to_string()
}

impl Action {
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Action::NextStage { .. } | Action::ReturnToBlankState | Action::CompleteWorkflow
        )
    }
}

/// A parsed trigger: literal text or a `|`-alternation of literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPattern {
    alternatives: Vec<String>,
}

impl TriggerPattern {
    pub fn parse(raw: &str) -> Result<Self, OrchestratorError> {
        let alternatives: Vec<String> = raw.split('|').map(|s| s.trim().to_string()).collect();
        if alternatives.iter().any(|a| a.is_empty()) {
            return Err(OrchestratorError::Validation(format!(
                "Malformed trigger pattern '{}': empty alternative",
                raw
            )));
        }
        Ok(Self { alternatives })
    }

    /// First alternative found in `text`, in declaration order.
    pub fn find_in(&self, text: &str) -> Option<&str> {
        self.alternatives
            .iter()
            .find(|alt| text.contains(alt.as_str()))
            .map(|s| s.as_str())
    }

    pub fn alternatives(&self) -> &[String] {
        &self.alternatives
    }
}

/// Structural limits enforced at load time.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Maximum nesting depth of conditional/parallel/foreach.
    pub max_action_depth: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_action_depth: 8,
        }
    }
}

impl WorkflowDefinition {
    /// Parse a YAML document, resolve fragment aliases, and validate.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, OrchestratorError> {
        Self::from_yaml_str_with_limits(yaml, &ValidationLimits::default())
    }

    pub fn from_yaml_str_with_limits(
        yaml: &str,
        limits: &ValidationLimits,
    ) -> Result<Self, OrchestratorError> {
        let mut definition: WorkflowDefinition = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::Validation(format!("Workflow parse error: {}", e)))?;
        definition.resolve_fragments()?;
        definition.validate(limits)?;
        Ok(definition)
    }

    pub async fn load(path: &str) -> Result<Self, OrchestratorError> {
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::Validation(format!("Cannot read workflow {}: {}", path, e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn entry_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }

    /// The idle stage `return_to_blank_state` re-enters.
    pub fn blank_stage_id(&self) -> Option<&str> {
        self.settings
            .blank_stage
            .as_deref()
            .or_else(|| self.stages.first().map(|s| s.id.as_str()))
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    // ── Fragment resolution ────────────────────────────────────────────

    /// Replace every `fragment` alias with the aliased actions. Runs before
    /// validation so the engine only ever sees concrete actions.
    pub fn resolve_fragments(&mut self) -> Result<(), OrchestratorError> {
        let fragments = self.fragments.clone();
        for stage in &mut self.stages {
            stage.on_success = resolve_fragment_list(&stage.on_success, &fragments, 0)?;
            stage.on_failure = resolve_fragment_list(&stage.on_failure, &fragments, 0)?;
        }
        Ok(())
    }

    // ── Load-time validation ───────────────────────────────────────────

    pub fn validate(&self, limits: &ValidationLimits) -> Result<(), OrchestratorError> {
        if self.stages.is_empty() {
            return Err(OrchestratorError::Validation(
                "Workflow has no stages".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(OrchestratorError::Validation(format!(
                    "Duplicate stage id '{}'",
                    stage.id
                )));
            }
        }

        if let Some(blank) = &self.settings.blank_stage {
            if self.stage(blank).is_none() {
                return Err(OrchestratorError::Validation(format!(
                    "Designated blank stage '{}' does not exist",
                    blank
                )));
            }
        }

        for stage in &self.stages {
            TriggerPattern::parse(&stage.trigger_keyword)?;

            let depth = action_list_depth(&stage.on_success)
                .max(action_list_depth(&stage.on_failure));
            if depth > limits.max_action_depth {
                return Err(OrchestratorError::WorkflowTooComplex {
                    depth,
                    max_depth: limits.max_action_depth,
                });
            }

            self.check_stage_refs(&stage.id, &stage.on_success)?;
            self.check_stage_refs(&stage.id, &stage.on_failure)?;

            // A success list must resolve to exactly one control transfer;
            // a failure list to at most one (none means the run aborts).
            let success_controls = control_count(&stage.id, &stage.on_success)?;
            if success_controls != 1 {
                return Err(OrchestratorError::AmbiguousTransition {
                    stage_id: stage.id.clone(),
                    count: success_controls,
                });
            }
            let failure_controls = control_count(&stage.id, &stage.on_failure)?;
            if failure_controls > 1 {
                return Err(OrchestratorError::AmbiguousTransition {
                    stage_id: stage.id.clone(),
                    count: failure_controls,
                });
            }
        }

        Ok(())
    }

    fn check_stage_refs(&self, stage_id: &str, actions: &[Action]) -> Result<(), OrchestratorError> {
        for action in actions {
            match action {
                Action::NextStage { stage } => {
                    if self.stage(stage).is_none() {
                        return Err(OrchestratorError::Validation(format!(
                            "Stage '{}' references unknown stage '{}'",
                            stage_id, stage
                        )));
                    }
                }
                Action::Conditional { then, otherwise, .. } => {
                    self.check_stage_refs(stage_id, then)?;
                    self.check_stage_refs(stage_id, otherwise)?;
                }
                Action::Parallel { branches, .. } => {
                    for branch in branches {
                        self.check_stage_refs(stage_id, branch)?;
                    }
                }
                Action::Foreach { body, .. } => {
                    self.check_stage_refs(stage_id, body)?;
                }
                Action::Fragment { fragment } => {
                    return Err(OrchestratorError::Validation(format!(
                        "Stage '{}' uses unresolved fragment '{}'",
                        stage_id, fragment
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn resolve_fragment_list(
    actions: &[Action],
    fragments: &HashMap<String, Vec<Action>>,
    depth: usize,
) -> Result<Vec<Action>, OrchestratorError> {
    // Fragments may reference fragments; a cycle would recurse forever.
    if depth > 16 {
        return Err(OrchestratorError::Validation(
            "Fragment aliases nest too deeply (cycle?)".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            Action::Fragment { fragment } => {
                let body = fragments.get(fragment).ok_or_else(|| {
                    OrchestratorError::Validation(format!("Unknown fragment '{}'", fragment))
                })?;
                out.extend(resolve_fragment_list(body, fragments, depth + 1)?);
            }
            Action::Conditional {
                condition,
                then,
                otherwise,
            } => out.push(Action::Conditional {
                condition: condition.clone(),
                then: resolve_fragment_list(then, fragments, depth + 1)?,
                otherwise: resolve_fragment_list(otherwise, fragments, depth + 1)?,
            }),
            Action::Parallel {
                branches,
                max_concurrent,
                wait_all,
            } => out.push(Action::Parallel {
                branches: branches
                    .iter()
                    .map(|b| resolve_fragment_list(b, fragments, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?,
                max_concurrent: *max_concurrent,
                wait_all: *wait_all,
            }),
            Action::Foreach {
                items,
                bind_as,
                body,
            } => out.push(Action::Foreach {
                items: items.clone(),
                bind_as: bind_as.clone(),
                body: resolve_fragment_list(body, fragments, depth + 1)?,
            }),
            other => out.push(other.clone()),
        }
    }
    Ok(out)
}

/// Nesting depth of structured actions (conditional/parallel/foreach).
fn action_list_depth(actions: &[Action]) -> usize {
    actions
        .iter()
        .map(|action| match action {
            Action::Conditional { then, otherwise, .. } => {
                1 + action_list_depth(then).max(action_list_depth(otherwise))
            }
            Action::Parallel { branches, .. } => {
                1 + branches.iter().map(|b| action_list_depth(b)).max().unwrap_or(0)
            }
            Action::Foreach { body, .. } => 1 + action_list_depth(body),
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// How many control transfers a list statically resolves to.
///
/// A conditional whose branches both resolve to exactly one control action
/// counts as one; mixed branches are ambiguous. Control transfers inside
/// parallel branches or foreach bodies can never take effect, so they are
/// rejected outright.
fn control_count(stage_id: &str, actions: &[Action]) -> Result<usize, OrchestratorError> {
    let mut count = 0;
    for action in actions {
        match action {
            a if a.is_control() => count += 1,
            Action::Conditional { then, otherwise, .. } => {
                let t = control_count(stage_id, then)?;
                let e = control_count(stage_id, otherwise)?;
                match (t, e) {
                    (0, 0) => {}
                    (1, 1) => count += 1,
                    _ => {
                        return Err(OrchestratorError::AmbiguousTransition {
                            stage_id: stage_id.to_string(),
                            count: t.max(e),
                        })
                    }
                }
            }
            Action::Parallel { branches, .. } => {
                for branch in branches {
                    if control_count(stage_id, branch)? > 0 {
                        return Err(OrchestratorError::Validation(format!(
                            "Stage '{}': control transfer inside a parallel branch",
                            stage_id
                        )));
                    }
                }
            }
            Action::Foreach { body, .. } => {
                if control_count(stage_id, body)? > 0 {
                    return Err(OrchestratorError::Validation(format!(
                        "Stage '{}': control transfer inside a foreach body",
                        stage_id
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(count)
}
