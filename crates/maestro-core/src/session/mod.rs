//! Interactive-session transport abstraction.
//!
//! Instances converse through a terminal multiplexer. The orchestration
//! layers only ever see the four operations of [`SessionTransport`], so a
//! scripted double drives the exact same code paths as the tmux
//! implementation.

pub mod fake;
pub mod tmux;

pub use fake::FakeTransport;
pub use tmux::TmuxTransport;

use async_trait::async_trait;

use crate::error::OrchestratorError;

/// Opaque handle to one live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The consumed terminal-multiplexer interface.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Allocate a new session rooted in `work_dir`.
    async fn create_session(&self, work_dir: &str) -> Result<SessionHandle, OrchestratorError>;

    /// Type `text` into the session; `submit` additionally presses Enter.
    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        submit: bool,
    ) -> Result<(), OrchestratorError>;

    /// Capture the last `lines` lines of the session's visible output.
    async fn capture_pane(
        &self,
        handle: &SessionHandle,
        lines: u32,
    ) -> Result<String, OrchestratorError>;

    /// Tear the session down. Destroying an already-gone session is a no-op.
    async fn destroy_session(&self, handle: &SessionHandle) -> Result<(), OrchestratorError>;
}
