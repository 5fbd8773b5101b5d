//! Maestro Core — transport-agnostic orchestration of interactive worker
//! sessions.
//!
//! Maestro drives a hierarchy of long-running worker sessions (Top → Mid →
//! Leaf) through declarative multi-stage workflows. A workflow stage sends a
//! rendered prompt to a session, polls its captured output for a trigger
//! keyword, and then runs an action program that can branch, fan out, call
//! scripts and HTTP endpoints, and spawn or terminate further instances.
//!
//! This crate has no launcher dependency: the terminal multiplexer and the
//! durable store are consumed through narrow capability traits
//! ([`session::SessionTransport`], [`store::KvStore`]), so the CLI, an
//! embedding server, and the test suite all drive the same code paths.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowEngine
//!                                              │
//!                               Optimizer (pool / batch / cache)
//!                                              │
//!                                       InstanceManager
//!                                        │           │
//!                                   KvStore    SessionTransport
//!                                  (sqlite)        (tmux)
//! ```

pub mod access;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod models;
pub mod optimizer;
pub mod session;
pub mod state;
pub mod store;
pub mod tools;
pub mod workflow;

// Convenience re-exports
pub use error::OrchestratorError;
pub use lifecycle::{InstanceManager, LifecycleConfig, TerminationPolicy};
pub use optimizer::Optimizer;
pub use state::{OrchestratorState, OrchestratorStateInner};
pub use workflow::{RunResult, RunStatus, WorkflowDefinition, WorkflowEngine};
