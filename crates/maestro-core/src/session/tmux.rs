//! tmux-backed session transport.
//!
//! Each session is a detached tmux session named `maestro-<uuid>`. Commands
//! are issued through the `tmux` binary with a hard per-invocation timeout
//! so a wedged server can never hang the orchestrator.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::OrchestratorError;
use crate::session::{SessionHandle, SessionTransport};

const TMUX_COMMAND_TIMEOUT_SECS: u64 = 15;

pub struct TmuxTransport {
    /// Path to the tmux binary ("tmux" resolves via PATH).
    tmux_bin: String,
}

impl TmuxTransport {
    pub fn new() -> Self {
        Self {
            tmux_bin: "tmux".to_string(),
        }
    }

    pub fn with_binary(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
        }
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<String, OrchestratorError> {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::Transport(format!("tmux spawn failed: {}", e)))?;

        let output = tokio::time::timeout(
            Duration::from_secs(TMUX_COMMAND_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            OrchestratorError::Transport(format!(
                "tmux {} timed out after {}s",
                args.first().unwrap_or(&""),
                TMUX_COMMAND_TIMEOUT_SECS
            ))
        })?
        .map_err(|e| OrchestratorError::Transport(format!("tmux wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Transport(format!(
                "tmux {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionTransport for TmuxTransport {
    async fn create_session(&self, work_dir: &str) -> Result<SessionHandle, OrchestratorError> {
        let name = format!("maestro-{}", uuid::Uuid::new_v4());
        self.run_tmux(&["new-session", "-d", "-s", &name, "-c", work_dir])
            .await?;
        tracing::debug!("[Tmux] Created session {} in {}", name, work_dir);
        Ok(SessionHandle(name))
    }

    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        submit: bool,
    ) -> Result<(), OrchestratorError> {
        // Literal mode (-l) so prompt text is never interpreted as key names.
        self.run_tmux(&["send-keys", "-t", handle.as_str(), "-l", text])
            .await?;
        if submit {
            self.run_tmux(&["send-keys", "-t", handle.as_str(), "Enter"])
                .await?;
        }
        Ok(())
    }

    async fn capture_pane(
        &self,
        handle: &SessionHandle,
        lines: u32,
    ) -> Result<String, OrchestratorError> {
        let start = format!("-{}", lines);
        self.run_tmux(&["capture-pane", "-p", "-t", handle.as_str(), "-S", &start])
            .await
    }

    async fn destroy_session(&self, handle: &SessionHandle) -> Result<(), OrchestratorError> {
        match self
            .run_tmux(&["kill-session", "-t", handle.as_str()])
            .await
        {
            Ok(_) => Ok(()),
            // Killing a session that already exited must stay a no-op.
            Err(OrchestratorError::Transport(msg)) if msg.contains("can't find session") => {
                tracing::debug!("[Tmux] Session {} already gone", handle);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
