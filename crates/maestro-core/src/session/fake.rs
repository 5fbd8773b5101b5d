//! Scripted in-memory transport.
//!
//! Satisfies [`SessionTransport`] for tests and dry runs: pane content is a
//! plain string that test code appends to, sends are recorded, and
//! individual `create_session` calls can be made to fail on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::session::{SessionHandle, SessionTransport};

#[derive(Debug, Default)]
struct FakeSession {
    work_dir: String,
    pane: String,
    sent: Vec<(String, bool)>,
}

#[derive(Default)]
struct FakeInner {
    next_id: u64,
    create_count: usize,
    fail_creates_at: HashSet<usize>,
    /// When true, new sessions start with an empty pane (readiness probes
    /// will not pass until output is pushed).
    silent_start: bool,
    sessions: HashMap<String, FakeSession>,
    destroyed: Vec<String>,
}

#[derive(Default)]
pub struct FakeTransport {
    inner: Mutex<FakeInner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeInner> {
        self.inner.lock().expect("FakeTransport lock poisoned")
    }

    /// Make the `n`-th `create_session` call (0-based) fail.
    pub fn fail_create_at(&self, n: usize) {
        self.lock().fail_creates_at.insert(n);
    }

    /// New sessions start with an empty pane until output is pushed.
    pub fn set_silent_start(&self, silent: bool) {
        self.lock().silent_start = silent;
    }

    /// Append a line to a session's pane content.
    pub fn push_output(&self, handle: &SessionHandle, text: &str) {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(handle.as_str()) {
            session.pane.push_str(text);
            session.pane.push('\n');
        }
    }

    /// Everything sent to a session so far, as (text, submitted) pairs.
    pub fn sent_keys(&self, handle: &SessionHandle) -> Vec<(String, bool)> {
        self.lock()
            .sessions
            .get(handle.as_str())
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    pub fn work_dir_of(&self, handle: &SessionHandle) -> Option<String> {
        self.lock()
            .sessions
            .get(handle.as_str())
            .map(|s| s.work_dir.clone())
    }

    pub fn live_session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn was_destroyed(&self, handle: &SessionHandle) -> bool {
        self.lock().destroyed.iter().any(|s| s == handle.as_str())
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn create_session(&self, work_dir: &str) -> Result<SessionHandle, OrchestratorError> {
        let mut inner = self.lock();
        let call_index = inner.create_count;
        inner.create_count += 1;
        if inner.fail_creates_at.contains(&call_index) {
            return Err(OrchestratorError::Transport(format!(
                "scripted create_session failure at call {}",
                call_index
            )));
        }

        inner.next_id += 1;
        let name = format!("fake-{}", inner.next_id);
        let pane = if inner.silent_start {
            String::new()
        } else {
            "$ \n".to_string()
        };
        inner.sessions.insert(
            name.clone(),
            FakeSession {
                work_dir: work_dir.to_string(),
                pane,
                sent: Vec::new(),
            },
        );
        Ok(SessionHandle(name))
    }

    async fn send_keys(
        &self,
        handle: &SessionHandle,
        text: &str,
        submit: bool,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(handle.as_str())
            .ok_or_else(|| OrchestratorError::Transport(format!("no session {}", handle)))?;
        session.sent.push((text.to_string(), submit));
        Ok(())
    }

    async fn capture_pane(
        &self,
        handle: &SessionHandle,
        lines: u32,
    ) -> Result<String, OrchestratorError> {
        let inner = self.lock();
        let session = inner
            .sessions
            .get(handle.as_str())
            .ok_or_else(|| OrchestratorError::Transport(format!("no session {}", handle)))?;
        let all: Vec<&str> = session.pane.lines().collect();
        let start = all.len().saturating_sub(lines as usize);
        Ok(all[start..].join("\n"))
    }

    async fn destroy_session(&self, handle: &SessionHandle) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        inner.sessions.remove(handle.as_str());
        inner.destroyed.push(handle.as_str().to_string());
        Ok(())
    }
}
