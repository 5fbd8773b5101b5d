//! Workflow execution engine.
//!
//! A run drives one target instance through the stage graph:
//!
//! ```text
//!   ┌─────────┐  send prompt   ┌──────────────┐  trigger found  ┌───────────┐
//!   │  stage   │ ─────────────▶ │ poll output  │ ──────────────▶ │ on_success │
//!   └─────────┘                └──────┬───────┘                 └─────┬─────┘
//!        ▲                            │ timeout                       │ control
//!        │                            ▼                               ▼
//!        │                      ┌──────────────┐              next / blank /
//!        └──────────────────────│  on_failure  │              complete
//!                               └──────────────┘
//! ```
//!
//! The engine checkpoints under `run:{run_id}` on every stage entry, so a
//! crashed run can be resumed from its last recorded stage. Terminating the
//! target instance mid-stage interrupts the poll and aborts the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::events::{EventBus, InstanceEvent, InstanceEventType};
use crate::lifecycle::{CreateInstanceRequest, InstanceManager};
use crate::models::{InstanceRole, WorkspaceMode};
use crate::optimizer::Optimizer;
use crate::store::KvStore;
use crate::workflow::context::{ExecutionContext, DEFAULT_MAX_ENTRIES};
use crate::workflow::schema::{
    Action, ItemsSource, LogLevel, OnFailure, Stage, TriggerPattern, ValidationLimits,
    WorkflowDefinition,
};
use crate::workflow::template;

const MATCHED_TRIGGER_KEY: &str = "matched_trigger";
const LAST_OUTPUT_KEY: &str = "last_output";
const SELF_KEY: &str = "self";

fn run_key(run_id: &str) -> String {
    format!("run:{}", run_id)
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Currently executing (only ever seen in checkpoints).
    Running,
    Completed,
    Aborted,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::TimedOut => "timedout",
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub stages_visited: Vec<String>,
    pub context: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What gets persisted under `run:{run_id}` at every stage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCheckpoint {
    pub workflow_name: String,
    pub target_instance: String,
    pub stage_id: String,
    pub status: RunStatus,
    pub transitions: u32,
    pub stages_visited: Vec<String>,
    pub context: ExecutionContext,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on stage transitions per run.
    pub max_transitions: u32,
    /// Pane lines captured per trigger poll.
    pub capture_lines: u32,
    /// Context entry cap; oldest bindings rotate out beyond it.
    pub max_context_entries: usize,
    pub limits: ValidationLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transitions: 1000,
            capture_lines: 50,
            max_context_entries: DEFAULT_MAX_ENTRIES,
            limits: ValidationLimits::default(),
        }
    }
}

/// Control transfer produced by an action list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Next(String),
    Blank,
    Complete,
}

/// How a stage's trigger wait ended. Both resolved outcomes carry the
/// final capture so the run's `last_output` always reflects the stage
/// that produced it.
enum StageWait {
    Matched { alternative: String, output: String },
    TimedOut { output: String },
    Cancelled(String),
}

/// Everything an action needs to know about where it runs.
#[derive(Clone)]
struct Scope {
    workflow: Arc<WorkflowDefinition>,
    stage_id: String,
    target: String,
    run_id: String,
}

pub struct WorkflowEngine {
    runner: ActionRunner,
    store: Arc<dyn KvStore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(optimizer: Arc<Optimizer>, store: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        Self {
            runner: ActionRunner {
                optimizer,
                http: reqwest::Client::new(),
            },
            store,
            config,
        }
    }

    fn manager(&self) -> &Arc<InstanceManager> {
        self.runner.optimizer.manager()
    }

    fn events(&self) -> &EventBus {
        self.manager().events()
    }

    /// Execute a workflow against `target` from its entry stage.
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        target: &str,
        initial: HashMap<String, Value>,
    ) -> Result<RunResult, OrchestratorError> {
        workflow.validate(&self.config.limits)?;
        let entry = workflow
            .entry_stage()
            .ok_or_else(|| OrchestratorError::Validation("Workflow has no stages".to_string()))?
            .id
            .clone();

        let run_id = Uuid::new_v4().to_string();
        let mut ctx = ExecutionContext::from_map(initial, self.config.max_context_entries);
        ctx.set(SELF_KEY, Value::String(target.to_string()));

        self.run_from(workflow, target, &run_id, ctx, entry, Vec::new(), 0)
            .await
    }

    /// Resume a checkpointed run from its last recorded stage.
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        run_id: &str,
        target: &str,
    ) -> Result<RunResult, OrchestratorError> {
        workflow.validate(&self.config.limits)?;
        let raw = self
            .store
            .get(&run_key(run_id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("run {}", run_id)))?;
        let checkpoint: RunCheckpoint = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Store(format!("corrupt checkpoint: {}", e)))?;
        if checkpoint.status != RunStatus::Running {
            return Err(OrchestratorError::Validation(format!(
                "Run {} already finished with status {}",
                run_id,
                checkpoint.status.as_str()
            )));
        }

        info!(
            "[Engine] Resuming run {} at stage '{}'",
            run_id, checkpoint.stage_id
        );
        self.run_from(
            workflow,
            target,
            run_id,
            checkpoint.context,
            checkpoint.stage_id,
            checkpoint.stages_visited,
            checkpoint.transitions,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_from(
        &self,
        workflow: &WorkflowDefinition,
        target: &str,
        run_id: &str,
        mut ctx: ExecutionContext,
        start_stage: String,
        mut visited: Vec<String>,
        mut transitions: u32,
    ) -> Result<RunResult, OrchestratorError> {
        let workflow = Arc::new(workflow.clone());
        // Snapshot for return_to_blank_state: the run restarts its context
        // from what it was handed, not from empty-of-everything.
        let initial_snapshot = ctx.clone();
        let mut stage_id = start_stage;
        let poll = Duration::from_secs(workflow.settings.poll_interval_secs);

        loop {
            transitions += 1;
            if transitions > self.config.max_transitions {
                return self
                    .finish(
                        run_id,
                        target,
                        &workflow,
                        &stage_id,
                        RunStatus::Aborted,
                        visited,
                        ctx,
                        Some(format!(
                            "transition cap {} exceeded",
                            self.config.max_transitions
                        )),
                    )
                    .await;
            }

            let stage = workflow.stage(&stage_id).ok_or_else(|| {
                OrchestratorError::Validation(format!("Unknown stage '{}'", stage_id))
            })?;
            visited.push(stage.id.clone());
            info!("[Engine] Run {} entering stage '{}'", run_id, stage.id);
            self.events().emit(InstanceEvent::new(
                InstanceEventType::StageEntered,
                target,
                json!({ "runId": run_id, "stage": stage.id }),
            ));

            self.checkpoint(run_id, target, &workflow, stage, RunStatus::Running, &visited, transitions, &ctx)
                .await?;

            let prompt = template::render(&stage.prompt, &ctx);
            if !prompt.is_empty() {
                if let Err(e) = self.manager().send_to_instance(target, &prompt).await {
                    return self
                        .finish(
                            run_id, target, &workflow, &stage_id,
                            RunStatus::Aborted, visited, ctx,
                            Some(format!("prompt delivery failed: {}", e)),
                        )
                        .await;
                }
            }

            let trigger = TriggerPattern::parse(&stage.trigger_keyword)?;
            let timeout_secs = stage.timeout_secs.unwrap_or(workflow.settings.timeout_secs);
            let wait = self
                .wait_for_trigger(target, &trigger, poll, Duration::from_secs(timeout_secs))
                .await;

            let scope = Scope {
                workflow: workflow.clone(),
                stage_id: stage.id.clone(),
                target: target.to_string(),
                run_id: run_id.to_string(),
            };

            let transition = match wait {
                StageWait::Matched { alternative, output } => {
                    debug!(
                        "[Engine] Run {} stage '{}' matched '{}'",
                        run_id, stage.id, alternative
                    );
                    ctx.set(MATCHED_TRIGGER_KEY, Value::String(alternative));
                    ctx.set(LAST_OUTPUT_KEY, Value::String(output));
                    match self
                        .runner
                        .execute_list(&mut ctx, &stage.on_success, &scope)
                        .await
                    {
                        Ok(transition) => transition,
                        Err(e) => {
                            return self
                                .finish(
                                    run_id, target, &workflow, &stage_id,
                                    RunStatus::Aborted, visited, ctx,
                                    Some(e.to_string()),
                                )
                                .await
                        }
                    }
                }
                StageWait::TimedOut { output } => {
                    warn!(
                        "[Engine] Run {} stage '{}' timed out after {}s",
                        run_id, stage.id, timeout_secs
                    );
                    // Surface what the pane showed when the wait gave up,
                    // not the previous stage's matched output.
                    ctx.set(LAST_OUTPUT_KEY, Value::String(output));
                    if stage.on_failure.is_empty() {
                        return self
                            .finish(
                                run_id, target, &workflow, &stage_id,
                                RunStatus::TimedOut, visited, ctx,
                                Some(
                                    OrchestratorError::StageTimeout {
                                        stage_id: stage.id.clone(),
                                        timeout_secs,
                                    }
                                    .to_string(),
                                ),
                            )
                            .await;
                    }
                    match self
                        .runner
                        .execute_list(&mut ctx, &stage.on_failure, &scope)
                        .await
                    {
                        // A failure list without a control transfer still
                        // ends the run; it only got to clean up first.
                        Ok(None) => {
                            return self
                                .finish(
                                    run_id, target, &workflow, &stage_id,
                                    RunStatus::TimedOut, visited, ctx,
                                    Some(
                                        OrchestratorError::StageTimeout {
                                            stage_id: stage.id.clone(),
                                            timeout_secs,
                                        }
                                        .to_string(),
                                    ),
                                )
                                .await
                        }
                        Ok(Some(transition)) => Some(transition),
                        Err(e) => {
                            return self
                                .finish(
                                    run_id, target, &workflow, &stage_id,
                                    RunStatus::Aborted, visited, ctx,
                                    Some(e.to_string()),
                                )
                                .await
                        }
                    }
                }
                StageWait::Cancelled(reason) => {
                    return self
                        .finish(
                            run_id, target, &workflow, &stage_id,
                            RunStatus::Aborted, visited, ctx,
                            Some(format!("instance wait interrupted: {}", reason)),
                        )
                        .await
                }
            };

            // The journal only needs to survive a single stage's parallel
            // forks; drop it so long runs don't accumulate settled writes.
            ctx.commit_writes();

            match transition {
                Some(Transition::Next(next)) => stage_id = next,
                Some(Transition::Blank) => {
                    // Blank re-entry clears run-scoped context back to the
                    // run's initial bindings.
                    ctx = initial_snapshot.clone();
                    stage_id = match workflow.blank_stage_id() {
                        Some(id) => id.to_string(),
                        None => {
                            return self
                                .finish(
                                    run_id, target, &workflow, &stage_id,
                                    RunStatus::Aborted, visited, ctx,
                                    Some("no blank stage defined".to_string()),
                                )
                                .await
                        }
                    };
                }
                Some(Transition::Complete) => {
                    return self
                        .finish(
                            run_id, target, &workflow, &stage_id,
                            RunStatus::Completed, visited, ctx, None,
                        )
                        .await
                }
                // Validation guarantees a success-list transition; landing
                // here means the failure list declined to transfer.
                None => {
                    return self
                        .finish(
                            run_id, target, &workflow, &stage_id,
                            RunStatus::Aborted, visited, ctx,
                            Some("stage produced no transition".to_string()),
                        )
                        .await
                }
            }
        }
    }

    /// Poll captured output for the trigger, reacting to termination events
    /// for the watched instance between polls.
    async fn wait_for_trigger(
        &self,
        target: &str,
        trigger: &TriggerPattern,
        poll: Duration,
        timeout: Duration,
    ) -> StageWait {
        let mut rx = self.events().subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let output = match self.manager().read_output(target, self.config.capture_lines).await {
                Ok(output) => output,
                // The session vanished under us; same outcome as a
                // termination event.
                Err(e) => return StageWait::Cancelled(e.to_string()),
            };
            if let Some(alternative) = trigger.find_in(&output) {
                return StageWait::Matched {
                    alternative: alternative.to_string(),
                    output,
                };
            }
            if Instant::now() >= deadline {
                return StageWait::TimedOut { output };
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                event = rx.recv() => {
                    if let Ok(event) = event {
                        if event.instance_id == target
                            && matches!(
                                event.event_type,
                                InstanceEventType::InstanceTerminated
                                    | InstanceEventType::InstanceFailed
                            )
                        {
                            return StageWait::Cancelled(format!(
                                "instance {} {}",
                                target,
                                event.event_type.as_str()
                            ));
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn checkpoint(
        &self,
        run_id: &str,
        target: &str,
        workflow: &WorkflowDefinition,
        stage: &Stage,
        status: RunStatus,
        visited: &[String],
        transitions: u32,
        ctx: &ExecutionContext,
    ) -> Result<(), OrchestratorError> {
        let checkpoint = RunCheckpoint {
            workflow_name: workflow.name.clone(),
            target_instance: target.to_string(),
            stage_id: stage.id.clone(),
            status,
            transitions,
            stages_visited: visited.to_vec(),
            context: ctx.clone(),
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string(&checkpoint)
            .map_err(|e| OrchestratorError::StorePersist(format!("checkpoint encode: {}", e)))?;
        self.store.set(&run_key(run_id), &raw).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run_id: &str,
        target: &str,
        workflow: &WorkflowDefinition,
        stage_id: &str,
        status: RunStatus,
        visited: Vec<String>,
        ctx: ExecutionContext,
        error: Option<String>,
    ) -> Result<RunResult, OrchestratorError> {
        let checkpoint = RunCheckpoint {
            workflow_name: workflow.name.clone(),
            target_instance: target.to_string(),
            stage_id: stage_id.to_string(),
            status,
            transitions: visited.len() as u32,
            stages_visited: visited.clone(),
            context: ctx.clone(),
            updated_at: Utc::now(),
        };
        if let Ok(raw) = serde_json::to_string(&checkpoint) {
            if let Err(e) = self.store.set(&run_key(run_id), &raw).await {
                warn!("[Engine] Failed to persist final state of run {}: {}", run_id, e);
            }
        }

        self.events().emit(InstanceEvent::new(
            InstanceEventType::RunFinished,
            target,
            json!({ "runId": run_id, "status": status.as_str() }),
        ));
        info!(
            "[Engine] Run {} finished: {} ({} stages visited)",
            run_id,
            status.as_str(),
            visited.len()
        );

        Ok(RunResult {
            run_id: run_id.to_string(),
            status,
            stages_visited: visited,
            context: ctx.into_values(),
            error,
        })
    }
}

// ── Action interpreter ─────────────────────────────────────────────────

/// Executes action lists. Clone-cheap so detached parallel branches can
/// carry their own copy into a spawned task.
#[derive(Clone)]
struct ActionRunner {
    optimizer: Arc<Optimizer>,
    http: reqwest::Client,
}

impl ActionRunner {
    fn manager(&self) -> &Arc<InstanceManager> {
        self.optimizer.manager()
    }

    /// Run a list in order, stopping at the first control transfer.
    fn execute_list<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        actions: &'a [Action],
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<Option<Transition>, OrchestratorError>> {
        Box::pin(async move {
            for (index, action) in actions.iter().enumerate() {
                if let Some(transition) = self
                    .execute_action(ctx, action, scope)
                    .await
                    .map_err(|e| wrap_action_error(scope, index, e))?
                {
                    return Ok(Some(transition));
                }
            }
            Ok(None)
        })
    }

    async fn execute_action(
        &self,
        ctx: &mut ExecutionContext,
        action: &Action,
        scope: &Scope,
    ) -> Result<Option<Transition>, OrchestratorError> {
        match action {
            Action::NextStage { stage } => Ok(Some(Transition::Next(stage.clone()))),
            Action::ReturnToBlankState => Ok(Some(Transition::Blank)),
            Action::CompleteWorkflow => Ok(Some(Transition::Complete)),

            Action::SendPrompt {
                target,
                text,
                await_keyword,
                await_timeout_secs,
            } => {
                let instance_id = match target {
                    Some(expr) => template::render(expr, ctx),
                    None => scope.target.clone(),
                };
                let text = template::render(text, ctx);
                self.manager().send_to_instance(&instance_id, &text).await?;

                if let Some(keyword) = await_keyword {
                    let keyword = template::render(keyword, ctx);
                    self.await_keyword(
                        &instance_id,
                        &keyword,
                        Duration::from_secs(scope.workflow.settings.poll_interval_secs),
                        Duration::from_secs(await_timeout_secs.unwrap_or(60)),
                    )
                    .await?;
                }
                Ok(None)
            }

            Action::RunScript {
                command,
                timeout_secs,
                on_failure,
                bind,
            } => {
                let command = template::render(command, ctx);
                let result = self
                    .run_script(&command, Duration::from_secs(timeout_secs.unwrap_or(60)))
                    .await;
                match result {
                    Ok(outcome) => {
                        let success = outcome["success"].as_bool().unwrap_or(false);
                        if let Some(bind) = bind {
                            ctx.set(bind.clone(), outcome);
                        }
                        if !success && *on_failure == OnFailure::Abort {
                            return Err(OrchestratorError::Validation(format!(
                                "script exited nonzero: {}",
                                command
                            )));
                        }
                        Ok(None)
                    }
                    Err(e) if *on_failure == OnFailure::Continue => {
                        warn!("[Engine] Script failed, continuing: {}", e);
                        if let Some(bind) = bind {
                            ctx.set(
                                bind.clone(),
                                json!({ "success": false, "error": e.to_string() }),
                            );
                        }
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }

            Action::HttpRequest {
                url,
                method,
                body,
                timeout_secs,
                on_failure,
                bind,
            } => {
                let url = template::render(url, ctx);
                let result = self
                    .http_request(
                        &url,
                        method,
                        body.as_ref(),
                        ctx,
                        Duration::from_secs(timeout_secs.unwrap_or(30)),
                    )
                    .await;
                match result {
                    Ok(outcome) => {
                        if let Some(bind) = bind {
                            ctx.set(bind.clone(), outcome);
                        }
                        Ok(None)
                    }
                    Err(e) if *on_failure == OnFailure::Continue => {
                        warn!("[Engine] HTTP request failed, continuing: {}", e);
                        if let Some(bind) = bind {
                            ctx.set(
                                bind.clone(),
                                json!({ "success": false, "error": e.to_string() }),
                            );
                        }
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }

            Action::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let branch = if template::eval_condition(condition, ctx)? {
                    then
                } else {
                    otherwise
                };
                self.execute_list(ctx, branch, scope).await
            }

            Action::Parallel {
                branches,
                max_concurrent,
                wait_all,
            } => {
                self.execute_parallel(ctx, branches, *max_concurrent, *wait_all, scope)
                    .await?;
                Ok(None)
            }

            Action::Foreach {
                items,
                bind_as,
                body,
            } => {
                let items = self.resolve_items(items, ctx)?;
                for item in items {
                    ctx.set(bind_as.clone(), item);
                    self.execute_list(ctx, body, scope).await?;
                }
                Ok(None)
            }

            Action::Template { template: tpl, bind } => {
                let rendered = template::render(tpl, ctx);
                ctx.set(bind.clone(), Value::String(rendered));
                Ok(None)
            }

            Action::SaveFile { path, content } => {
                let path = template::render(path, ctx);
                let content = template::render(content, ctx);
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        OrchestratorError::Validation(format!("mkdir {}: {}", parent.display(), e))
                    })?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| OrchestratorError::Validation(format!("write {}: {}", path, e)))?;
                Ok(None)
            }

            Action::Log { message, level } => {
                let message = template::render(message, ctx);
                match level {
                    LogLevel::Debug => debug!("[Workflow] {}", message),
                    LogLevel::Info => info!("[Workflow] {}", message),
                    LogLevel::Warn => warn!("[Workflow] {}", message),
                    LogLevel::Error => tracing::error!("[Workflow] {}", message),
                }
                Ok(None)
            }

            Action::Spawn {
                role,
                work_dir,
                prompt,
                parent,
                workspace_mode,
                bind,
            } => {
                let settings = &scope.workflow.settings;
                let role_str = role
                    .as_ref()
                    .map(|r| template::render(r, ctx))
                    .unwrap_or_else(|| settings.default_role.clone());
                let role = InstanceRole::from_str(&role_str).ok_or_else(|| {
                    OrchestratorError::Validation(format!("Unknown role '{}'", role_str))
                })?;
                let mode_str = workspace_mode
                    .as_ref()
                    .map(|m| template::render(m, ctx))
                    .unwrap_or_else(|| settings.default_workspace_mode.clone());
                let workspace_mode = WorkspaceMode::from_str(&mode_str).ok_or_else(|| {
                    OrchestratorError::Validation(format!("Unknown workspace mode '{}'", mode_str))
                })?;

                let request = CreateInstanceRequest {
                    role,
                    work_dir: template::render(work_dir, ctx),
                    initial_prompt: prompt.as_ref().map(|p| template::render(p, ctx)),
                    parent_id: parent.as_ref().map(|p| template::render(p, ctx)),
                    workspace_mode,
                };
                let instance = self.optimizer.spawn_instance(request).await?;
                if let Some(bind) = bind {
                    ctx.set(bind.clone(), Value::String(instance.id));
                }
                Ok(None)
            }

            Action::Terminate { instance } => {
                let instance_id = template::render(instance, ctx);
                self.manager().terminate_instance(&instance_id).await?;
                Ok(None)
            }

            // Resolved at load time; reaching the interpreter is a bug in
            // the caller (hand-built definition skipping resolution).
            Action::Fragment { fragment } => Err(OrchestratorError::Validation(format!(
                "Unresolved fragment '{}'",
                fragment
            ))),
        }
    }

    async fn execute_parallel(
        &self,
        ctx: &mut ExecutionContext,
        branches: &[Vec<Action>],
        max_concurrent: Option<usize>,
        wait_all: bool,
        scope: &Scope,
    ) -> Result<(), OrchestratorError> {
        if !wait_all {
            // Detached: branches run on their own tasks and their context
            // writes are discarded.
            for branch in branches {
                let runner = self.clone();
                let scope = scope.clone();
                let branch = branch.clone();
                let mut branch_ctx = ctx.fork();
                tokio::spawn(async move {
                    if let Err(e) = runner.execute_list(&mut branch_ctx, &branch, &scope).await {
                        warn!(
                            "[Engine] Detached branch in stage '{}' failed: {}",
                            scope.stage_id, e
                        );
                    }
                });
            }
            return Ok(());
        }

        let gate = Arc::new(tokio::sync::Semaphore::new(
            max_concurrent.unwrap_or(branches.len()).max(1),
        ));
        let branch_futures: Vec<_> = branches
            .iter()
            .map(|branch| {
                let gate = gate.clone();
                let mut branch_ctx = ctx.fork();
                async move {
                    let _permit = gate.acquire().await;
                    let result = self.execute_list(&mut branch_ctx, branch, scope).await;
                    result.map(|_| branch_ctx)
                }
            })
            .collect();

        let results = futures::future::join_all(branch_futures).await;
        let mut merged = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(branch_ctx) => merged.push(branch_ctx),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }
        // Successful branches merge even when a sibling failed; the error
        // surfaces only after every branch has settled.
        ctx.merge_branches(merged);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_keyword(
        &self,
        instance_id: &str,
        keyword: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let output = self.manager().read_output(instance_id, 50).await?;
            if output.contains(keyword) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Validation(format!(
                    "await of '{}' on {} timed out after {}s",
                    keyword,
                    instance_id,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn run_script(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Value, OrchestratorError> {
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .output(),
        )
        .await
        .map_err(|_| {
            OrchestratorError::Validation(format!(
                "script timed out after {}s: {}",
                timeout.as_secs(),
                command
            ))
        })?
        .map_err(|e| OrchestratorError::Validation(format!("script spawn failed: {}", e)))?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
            "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
            "exitCode": output.status.code(),
            "success": output.status.success(),
        }))
    }

    async fn http_request(
        &self,
        url: &str,
        method: &str,
        body: Option<&Value>,
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> Result<Value, OrchestratorError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| OrchestratorError::Validation(format!("Bad HTTP method '{}'", method)))?;

        let mut request = self.http.request(method, url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(&render_json(body, ctx));
        }
        let response = request
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(format!("http {}: {}", url, e)))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OrchestratorError::Transport(format!("http body {}: {}", url, e)))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if status >= 400 {
            return Err(OrchestratorError::Transport(format!(
                "http {} returned {}",
                url, status
            )));
        }
        Ok(json!({ "status": status, "body": body, "success": true }))
    }

    fn resolve_items(
        &self,
        items: &ItemsSource,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, OrchestratorError> {
        match items {
            ItemsSource::List(values) => Ok(values
                .iter()
                .map(|v| match v {
                    Value::String(s) => Value::String(template::render(s, ctx)),
                    other => other.clone(),
                })
                .collect()),
            ItemsSource::Expr(path) => match ctx.lookup(path.trim()) {
                Some(Value::Array(items)) => Ok(items.clone()),
                Some(other) => Err(OrchestratorError::Validation(format!(
                    "foreach items '{}' is not an array (got {})",
                    path,
                    other
                ))),
                None => Err(OrchestratorError::Validation(format!(
                    "foreach items '{}' not found in context",
                    path
                ))),
            },
        }
    }
}

/// Every string leaf in a JSON body is a template.
fn render_json(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(template::render(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_json(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn wrap_action_error(scope: &Scope, index: usize, e: OrchestratorError) -> OrchestratorError {
    match e {
        // Already carries its location; re-wrapping would bury the inner
        // index under the outer list's.
        err @ OrchestratorError::ActionExecution { .. } => err,
        other => OrchestratorError::ActionExecution {
            stage_id: scope.stage_id.clone(),
            action_index: index,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::lifecycle::LifecycleConfig;
    use crate::models::InstanceRole;
    use crate::session::FakeTransport;
    use crate::store::MemoryStore;

    struct Harness {
        engine: Arc<WorkflowEngine>,
        manager: Arc<InstanceManager>,
        transport: Arc<FakeTransport>,
        store: Arc<MemoryStore>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(InstanceManager::new(
            store.clone(),
            transport.clone(),
            EventBus::new(),
            LifecycleConfig {
                readiness_backoff: Duration::from_millis(1),
                persist_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let optimizer = Arc::new(Optimizer::new(
            manager.clone(),
            crate::optimizer::PoolConfig::default(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            optimizer,
            store.clone(),
            EngineConfig::default(),
        ));
        Harness {
            engine,
            manager,
            transport,
            store,
        }
    }

    async fn spawn_target(h: &Harness) -> crate::models::Instance {
        h.manager
            .create_instance(CreateInstanceRequest {
                role: InstanceRole::Top,
                work_dir: "/tmp/work".to_string(),
                initial_prompt: None,
                parent_id: None,
                workspace_mode: WorkspaceMode::Isolated,
            })
            .await
            .unwrap()
    }

    fn session_of(instance: &crate::models::Instance) -> crate::session::SessionHandle {
        crate::session::SessionHandle(instance.session_id.clone().unwrap())
    }

    const CYCLE_YAML: &str = r#"
name: review-cycle
settings:
  poll_interval_secs: 2
  timeout_secs: 120
  blank_stage: blank
stages:
  - id: compare
    prompt: "compare branches"
    trigger_keyword: "COMPARE_FINISHED"
    on_success:
      - action: template
        template: "cycle ${matched_trigger}"
        bind: cycle_marker
      - action: next_stage
        stage: commit
  - id: commit
    prompt: "commit the result"
    trigger_keyword: "COMMIT_FINISHED|COMMIT_FAILED"
    on_success:
      - action: return_to_blank_state
  - id: blank
    prompt: ""
    trigger_keyword: "SHUTDOWN"
    on_success:
      - action: complete_workflow
"#;

    #[tokio::test(start_paused = true)]
    async fn test_compare_commit_blank_cycle_clears_context() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        let workflow = WorkflowDefinition::from_yaml_str(CYCLE_YAML).unwrap();

        let transport = h.transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            transport.push_output(&session, "COMPARE_FINISHED");
            tokio::time::sleep(Duration::from_secs(5)).await;
            transport.push_output(&session, "COMMIT_FINISHED");
            tokio::time::sleep(Duration::from_secs(5)).await;
            transport.push_output(&session, "SHUTDOWN");
        });

        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.stages_visited, vec!["compare", "commit", "blank"]);
        // Blank re-entry dropped everything the cycle bound; what remains
        // is the blank stage's own match.
        assert!(!result.context.contains_key("cycle_marker"));
        assert_eq!(
            result.context[MATCHED_TRIGGER_KEY],
            Value::String("SHUTDOWN".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_within_one_poll_interval() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let yaml = r#"
name: stuck
settings:
  poll_interval_secs: 2
  timeout_secs: 120
stages:
  - id: wait
    prompt: "never finishes"
    trigger_keyword: "NEVER"
    on_success:
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();

        let started = Instant::now();
        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.status, RunStatus::TimedOut);
        assert!(result.error.unwrap().contains("wait"));
        // Fires at the configured timeout, overshooting by at most one
        // poll interval.
        assert!(elapsed >= Duration::from_secs(120), "fired early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(122), "fired late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_final_capture_not_prior_stage_match() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        let yaml = r#"
name: two-step
settings:
  poll_interval_secs: 2
  timeout_secs: 10
stages:
  - id: first
    prompt: "do step one"
    trigger_keyword: "STEP_ONE_DONE"
    on_success:
      - action: next_stage
        stage: second
  - id: second
    prompt: "do step two"
    trigger_keyword: "STEP_TWO_DONE"
    on_success:
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();

        let transport = h.transport.clone();
        tokio::spawn(async move {
            transport.push_output(&session, "STEP_ONE_DONE");
            tokio::time::sleep(Duration::from_secs(5)).await;
            transport.push_output(&session, "still grinding on step two");
        });

        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::TimedOut);
        // The reported capture is what the pane showed when the second
        // stage gave up, not the first stage's matched output.
        let last_output = result.context[LAST_OUTPUT_KEY].as_str().unwrap();
        assert!(last_output.contains("still grinding on step two"));
    }

    #[tokio::test]
    async fn test_parallel_merge_order_and_failure_isolation() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        h.transport.push_output(&session, "GO");

        let yaml = r#"
name: fanout
settings:
  poll_interval_secs: 0
  timeout_secs: 5
stages:
  - id: fan
    prompt: "go"
    trigger_keyword: "GO"
    on_success:
      - action: parallel
        branches:
          - - action: template
              template: "from-first"
              bind: shared
          - - action: run_script
              command: "exit 3"
              on_failure: continue
              bind: script_result
          - - action: template
              template: "from-third"
              bind: shared
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        // Declaration order decides collisions: the third branch wins.
        assert_eq!(result.context["shared"], json!("from-third"));
        // The failing middle branch recorded its outcome without aborting
        // its siblings or the stage.
        assert_eq!(result.context["script_result"]["success"], json!(false));
        assert_eq!(result.context["script_result"]["exitCode"], json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminating_target_mid_stage_aborts_run() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let yaml = r#"
name: interrupted
settings:
  poll_interval_secs: 2
  timeout_secs: 300
stages:
  - id: wait
    prompt: "waiting"
    trigger_keyword: "NEVER"
    on_success:
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();

        let engine = h.engine.clone();
        let target = instance.id.clone();
        let run = tokio::spawn(async move { engine.run(&workflow, &target, HashMap::new()).await });

        tokio::time::sleep(Duration::from_secs(7)).await;
        h.manager.terminate_instance(&instance.id).await.unwrap();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert!(result.error.unwrap().contains(&instance.id));
    }

    #[tokio::test]
    async fn test_trigger_alternation_binds_matched_alternative() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        h.transport.push_output(&session, "review said COMMIT_FAILED");

        let yaml = r#"
name: branchy
settings:
  poll_interval_secs: 0
  timeout_secs: 5
stages:
  - id: check
    prompt: "check"
    trigger_keyword: "COMMIT_FINISHED|COMMIT_FAILED"
    on_success:
      - action: conditional
        condition: 'matched_trigger == "COMMIT_FAILED"'
        then:
          - action: template
            template: "retrying"
            bind: verdict
          - action: complete_workflow
        else:
          - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.context["matched_trigger"], json!("COMMIT_FAILED"));
        assert_eq!(result.context["verdict"], json!("retrying"));
    }

    #[tokio::test]
    async fn test_checkpoint_persisted_and_resume_continues() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        h.transport.push_output(&session, "COMPARE_FINISHED");
        h.transport.push_output(&session, "COMMIT_FINISHED");
        h.transport.push_output(&session, "SHUTDOWN");

        let mut fast: WorkflowDefinition = WorkflowDefinition::from_yaml_str(CYCLE_YAML).unwrap();
        fast.settings.poll_interval_secs = 0;
        fast.settings.timeout_secs = 5;

        let result = h
            .engine
            .run(&fast, &instance.id, HashMap::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);

        // Terminal status landed in the store.
        let raw = h.store.get(&run_key(&result.run_id)).await.unwrap().unwrap();
        let checkpoint: RunCheckpoint = serde_json::from_str(&raw).unwrap();
        assert_eq!(checkpoint.status, RunStatus::Completed);

        // A mid-run checkpoint resumes from its recorded stage, not the
        // entry stage.
        let mid = RunCheckpoint {
            workflow_name: fast.name.clone(),
            target_instance: instance.id.clone(),
            stage_id: "commit".to_string(),
            status: RunStatus::Running,
            transitions: 1,
            stages_visited: vec!["compare".to_string()],
            context: ExecutionContext::new(DEFAULT_MAX_ENTRIES),
            updated_at: Utc::now(),
        };
        h.store
            .set(&run_key("resume-me"), &serde_json::to_string(&mid).unwrap())
            .await
            .unwrap();

        let resumed = h
            .engine
            .resume(&fast, "resume-me", &instance.id)
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.stages_visited, vec!["compare", "commit", "blank"]);
    }

    #[tokio::test]
    async fn test_foreach_and_send_prompt_actions() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        h.transport.push_output(&session, "START");

        let yaml = r#"
name: iterate
settings:
  poll_interval_secs: 0
  timeout_secs: 5
stages:
  - id: fan
    prompt: "begin"
    trigger_keyword: "START"
    on_success:
      - action: foreach
        items: ["alpha", "beta"]
        bind_as: task
        body:
          - action: send_prompt
            text: "work on ${task}"
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let sent = h.transport.sent_keys(&session);
        let texts: Vec<&str> = sent.iter().map(|(t, _)| t.as_str()).collect();
        assert!(texts.contains(&"work on alpha"));
        assert!(texts.contains(&"work on beta"));
    }

    #[tokio::test]
    async fn test_spawn_action_creates_child_instance() {
        let h = harness();
        let instance = spawn_target(&h).await;
        let session = session_of(&instance);
        h.transport.push_output(&session, "DELEGATE");

        let yaml = r#"
name: delegator
settings:
  poll_interval_secs: 0
  timeout_secs: 5
  default_role: mid
stages:
  - id: delegate
    prompt: "split the work"
    trigger_keyword: "DELEGATE"
    on_success:
      - action: spawn
        work_dir: "/tmp/child"
        parent: "${self}"
        prompt: "child task"
        bind: child_id
      - action: complete_workflow
"#;
        let workflow = WorkflowDefinition::from_yaml_str(yaml).unwrap();
        let result = h
            .engine
            .run(&workflow, &instance.id, HashMap::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let child_id = result.context["child_id"].as_str().unwrap();
        let child = h.manager.get_instance(child_id).await.unwrap();
        assert_eq!(child.role, InstanceRole::Mid);
        assert_eq!(child.parent_id.as_deref(), Some(instance.id.as_str()));
    }
}
