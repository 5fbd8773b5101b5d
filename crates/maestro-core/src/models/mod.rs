//! Core data models.

pub mod instance;

pub use instance::{Instance, InstanceFilter, InstanceRole, InstanceStatus, WorkspaceMode};
