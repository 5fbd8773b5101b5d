//! Declarative workflow layer: YAML definitions, the execution context,
//! template rendering, and the stage engine that drives an instance
//! through trigger-gated stages.

pub mod context;
pub mod engine;
pub mod schema;
pub mod template;

pub use context::ExecutionContext;
pub use engine::{EngineConfig, RunCheckpoint, RunResult, RunStatus, WorkflowEngine};
pub use schema::{
    Action, ItemsSource, LogLevel, OnFailure, Settings, Stage, TriggerPattern, ValidationLimits,
    WorkflowDefinition,
};
