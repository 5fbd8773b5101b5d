//! Instance lifecycle manager.
//!
//! Creates, queries, and terminates instance records against the durable
//! store and the session transport, enforcing the delegation hierarchy:
//! Top spawns Mid, Mid spawns Leaf, Leaf spawns nothing.
//!
//! Spawn sequence:
//!   1. Validate the parent→child role step (fails before any side effect)
//!   2. Allocate a session via the transport (bounded retries)
//!   3. Persist the record atomically (Pending)
//!   4. Readiness-probe the session with backoff; Pending → Active
//!   5. Send the initial prompt
//!
//! A failed probe marks the record Failed and releases the session; the
//! failure is scoped to that one instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::Stream;

use crate::access::validate_hierarchy;
use crate::error::OrchestratorError;
use crate::events::{EventBus, InstanceEvent, InstanceEventType};
use crate::models::{Instance, InstanceFilter, InstanceRole, InstanceStatus, WorkspaceMode};
use crate::session::{SessionHandle, SessionTransport};
use crate::store::KvStore;

const INSTANCE_KEY_PREFIX: &str = "instance:";

fn instance_key(id: &str) -> String {
    format!("{}{}", INSTANCE_KEY_PREFIX, id)
}

/// What happens to descendants when an instance is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Terminate the whole subtree, deepest first.
    Cascade,
    /// Leave descendants running with a dangling parent reference.
    Orphan,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Permit Top → Leaf spawns, bypassing Mid.
    pub allow_skip_level: bool,
    pub termination: TerminationPolicy,
    /// Readiness probe attempts before giving up with SpawnTimeout.
    pub readiness_attempts: u32,
    /// Base backoff between probes; grows linearly per attempt.
    pub readiness_backoff: Duration,
    /// Store/transport retry attempts before surfacing the error.
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    /// Page size for the lazy instance listing.
    pub list_page_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            allow_skip_level: false,
            termination: TerminationPolicy::Cascade,
            readiness_attempts: 10,
            readiness_backoff: Duration::from_millis(250),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
            list_page_size: 64,
        }
    }
}

/// Request to create one instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub role: InstanceRole,
    pub work_dir: String,
    pub initial_prompt: Option<String>,
    pub parent_id: Option<String>,
    pub workspace_mode: WorkspaceMode,
}

/// Persistence wrapper: instance records as JSON under `instance:{id}` keys.
///
/// All writes go through compare-and-swap against the previously read
/// serialization, retried with bounded backoff, so concurrent writers can
/// never silently clobber each other's record.
#[derive(Clone)]
pub struct InstanceStore {
    store: Arc<dyn KvStore>,
    attempts: u32,
    backoff: Duration,
}

impl InstanceStore {
    pub fn new(store: Arc<dyn KvStore>, config: &LifecycleConfig) -> Self {
        Self {
            store,
            attempts: config.persist_attempts,
            backoff: config.persist_backoff,
        }
    }

    fn encode(instance: &Instance) -> Result<String, OrchestratorError> {
        serde_json::to_string(instance)
            .map_err(|e| OrchestratorError::StorePersist(format!("encode failed: {}", e)))
    }

    fn decode(raw: &str) -> Result<Instance, OrchestratorError> {
        serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::Store(format!("corrupt instance record: {}", e)))
    }

    /// Insert a brand-new record; fails if the id already exists.
    pub async fn insert(&self, instance: &Instance) -> Result<(), OrchestratorError> {
        let raw = Self::encode(instance)?;
        let key = instance_key(&instance.id);
        let inserted = self
            .retry(|| async { self.store.compare_and_swap(&key, None, &raw).await })
            .await?;
        if inserted {
            Ok(())
        } else {
            Err(OrchestratorError::StorePersist(format!(
                "instance {} already exists",
                instance.id
            )))
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Instance>, OrchestratorError> {
        match self.store.get(&instance_key(id)).await? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write under CAS. `mutate` is reapplied on conflict.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Instance, OrchestratorError>
    where
        F: Fn(&mut Instance),
    {
        let key = instance_key(id);
        for attempt in 0..self.attempts.max(1) {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("Instance {}", id)))?;
            let mut instance = Self::decode(&raw)?;
            mutate(&mut instance);
            instance.updated_at = Utc::now();
            let new_raw = Self::encode(&instance)?;
            if self
                .store
                .compare_and_swap(&key, Some(&raw), &new_raw)
                .await?
            {
                return Ok(instance);
            }
            tokio::time::sleep(self.backoff * (attempt + 1)).await;
        }
        Err(OrchestratorError::StorePersist(format!(
            "lost CAS race on instance {} after {} attempts",
            id, self.attempts
        )))
    }

    pub async fn page(&self, offset: usize, limit: usize) -> Result<Vec<Instance>, OrchestratorError> {
        let keys = self
            .store
            .list_keys(INSTANCE_KEY_PREFIX, offset, limit)
            .await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store.get(&key).await? {
                out.push(Self::decode(&raw)?);
            }
        }
        Ok(out)
    }

    /// Direct children of `parent_id` (children are always derived, never
    /// stored redundantly).
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Instance>, OrchestratorError> {
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.page(offset, 128).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            out.extend(
                page.into_iter()
                    .filter(|i| i.parent_id.as_deref() == Some(parent_id)),
            );
        }
        Ok(out)
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T, OrchestratorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
    {
        let mut last_err = None;
        for attempt in 0..self.attempts.max(1) {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("[Lifecycle] store write failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                    tokio::time::sleep(self.backoff * (attempt + 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(OrchestratorError::StorePersist(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "store write exhausted retries".to_string()),
        ))
    }
}

/// The instance lifecycle manager.
pub struct InstanceManager {
    store: InstanceStore,
    transport: Arc<dyn SessionTransport>,
    events: EventBus,
    config: LifecycleConfig,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn SessionTransport>,
        events: EventBus,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store: InstanceStore::new(store, &config),
            transport,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn instance_store(&self) -> &InstanceStore {
        &self.store
    }

    /// Create an instance: validate hierarchy, allocate a session, persist,
    /// probe to Active, send the initial prompt.
    pub async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<Instance, OrchestratorError> {
        let parent_role = match &req.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get(parent_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("Instance {}", parent_id)))?;
                if parent.status.is_terminal() {
                    return Err(OrchestratorError::Hierarchy(format!(
                        "Parent {} is {}",
                        parent_id,
                        parent.status.as_str()
                    )));
                }
                Some(parent.role)
            }
            None => None,
        };
        validate_hierarchy(parent_role, req.role, self.config.allow_skip_level)?;

        // Session allocation, retried: transient transport trouble should
        // not fail the whole spawn.
        let handle = self.allocate_session(&req.work_dir).await?;

        let mut instance = Instance::new(
            uuid::Uuid::new_v4().to_string(),
            req.role,
            req.parent_id.clone(),
            req.work_dir.clone(),
            req.workspace_mode,
        );
        instance.session_id = Some(handle.as_str().to_string());

        if let Err(e) = self.store.insert(&instance).await {
            // Release the session; the record never existed.
            let _ = self.transport.destroy_session(&handle).await;
            return Err(e);
        }

        self.events.emit(InstanceEvent::new(
            InstanceEventType::InstanceCreated,
            &instance.id,
            serde_json::json!({ "role": instance.role, "parentId": instance.parent_id }),
        ));

        match self.probe_readiness(&handle, &instance.id).await {
            Ok(()) => {}
            Err(e) => {
                let _ = self.transport.destroy_session(&handle).await;
                let _ = self
                    .store
                    .update(&instance.id, |i| i.status = InstanceStatus::Failed)
                    .await;
                self.events.emit(InstanceEvent::new(
                    InstanceEventType::InstanceFailed,
                    &instance.id,
                    serde_json::json!({ "error": e.to_string() }),
                ));
                return Err(e);
            }
        }

        let instance = self
            .store
            .update(&instance.id, |i| i.status = InstanceStatus::Active)
            .await?;
        self.events.emit(InstanceEvent::new(
            InstanceEventType::InstanceActivated,
            &instance.id,
            serde_json::json!({}),
        ));

        if let Some(prompt) = &req.initial_prompt {
            self.transport.send_keys(&handle, prompt, true).await?;
        }

        tracing::info!(
            "[Lifecycle] Created {} instance {} in {} (session {})",
            instance.role.as_str(),
            instance.id,
            instance.work_dir,
            handle
        );

        Ok(instance)
    }

    async fn allocate_session(&self, work_dir: &str) -> Result<SessionHandle, OrchestratorError> {
        let mut last_err = None;
        for attempt in 0..self.config.persist_attempts.max(1) {
            match self.transport.create_session(work_dir).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!("[Lifecycle] session allocation failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                    tokio::time::sleep(self.config.persist_backoff * (attempt + 1)).await;
                }
            }
        }
        Err(OrchestratorError::SpawnFailure(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "session allocation exhausted retries".to_string()),
        ))
    }

    /// Poll the session until it shows any output; the shell prompt is the
    /// readiness signal.
    async fn probe_readiness(
        &self,
        handle: &SessionHandle,
        instance_id: &str,
    ) -> Result<(), OrchestratorError> {
        for attempt in 0..self.config.readiness_attempts.max(1) {
            match self.transport.capture_pane(handle, 5).await {
                Ok(pane) if !pane.trim().is_empty() => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("[Lifecycle] probe {} failed: {}", attempt + 1, e);
                }
            }
            tokio::time::sleep(self.config.readiness_backoff * (attempt + 1)).await;
        }
        Err(OrchestratorError::SpawnTimeout {
            instance_id: instance_id.to_string(),
            attempts: self.config.readiness_attempts,
        })
    }

    pub async fn get_instance(&self, id: &str) -> Result<Instance, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Instance {}", id)))
    }

    fn live_session(&self, instance: &Instance) -> Result<SessionHandle, OrchestratorError> {
        if instance.status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "Instance {} is {}",
                instance.id,
                instance.status.as_str()
            )));
        }
        instance
            .session_id
            .clone()
            .map(SessionHandle)
            .ok_or_else(|| {
                OrchestratorError::Transport(format!("Instance {} has no session", instance.id))
            })
    }

    /// Type a prompt into an instance's session and submit it.
    pub async fn send_to_instance(&self, id: &str, text: &str) -> Result<(), OrchestratorError> {
        let instance = self.get_instance(id).await?;
        let handle = self.live_session(&instance)?;
        self.transport.send_keys(&handle, text, true).await
    }

    /// Capture the last `lines` lines of an instance's visible output.
    pub async fn read_output(&self, id: &str, lines: u32) -> Result<String, OrchestratorError> {
        let instance = self.get_instance(id).await?;
        let handle = self.live_session(&instance)?;
        self.transport.capture_pane(&handle, lines).await
    }

    /// Lazy, finite, restartable listing. Each poll fetches one store page;
    /// dropping the stream abandons the scan, calling again restarts it.
    pub fn list_instances(
        &self,
        filter: InstanceFilter,
    ) -> impl Stream<Item = Result<Instance, OrchestratorError>> {
        let store = self.store.clone();
        let page_size = self.config.list_page_size;
        async_stream::try_stream! {
            let mut offset = 0;
            loop {
                let page = store.page(offset, page_size).await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                for instance in page {
                    if filter.matches(&instance) {
                        yield instance;
                    }
                }
            }
        }
    }

    /// Terminate an instance under the configured policy. Idempotent:
    /// terminating an already-Terminated instance succeeds as a no-op.
    pub async fn terminate_instance(&self, id: &str) -> Result<Instance, OrchestratorError> {
        self.terminate_with_policy(id, self.config.termination).await
    }

    pub async fn terminate_with_policy(
        &self,
        id: &str,
        policy: TerminationPolicy,
    ) -> Result<Instance, OrchestratorError> {
        let instance = self.get_instance(id).await?;
        if instance.status == InstanceStatus::Terminated {
            return Ok(instance);
        }

        if policy == TerminationPolicy::Cascade {
            // Deepest first, so no child ever outlives its ancestors' intent.
            let children = self.store.children(id).await?;
            for child in children {
                if !child.status.is_terminal() {
                    Box::pin(self.terminate_with_policy(&child.id, policy)).await?;
                }
            }
        }

        if let Some(session_id) = &instance.session_id {
            let handle = SessionHandle(session_id.clone());
            if let Err(e) = self.transport.destroy_session(&handle).await {
                tracing::warn!("[Lifecycle] session teardown for {} failed: {}", id, e);
            }
        }

        let terminated = self
            .store
            .update(id, |i| {
                i.status = InstanceStatus::Terminated;
                i.session_id = None;
            })
            .await?;

        self.events.emit(InstanceEvent::new(
            InstanceEventType::InstanceTerminated,
            id,
            serde_json::json!({}),
        ));
        tracing::info!("[Lifecycle] Terminated instance {}", id);

        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FakeTransport;
    use crate::store::MemoryStore;
    use tokio_stream::StreamExt;

    fn manager_with(config: LifecycleConfig) -> (InstanceManager, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let manager = InstanceManager::new(
            Arc::new(MemoryStore::new()),
            transport.clone(),
            EventBus::new(),
            config,
        );
        (manager, transport)
    }

    fn manager() -> (InstanceManager, Arc<FakeTransport>) {
        manager_with(LifecycleConfig {
            readiness_backoff: Duration::from_millis(1),
            persist_backoff: Duration::from_millis(1),
            ..Default::default()
        })
    }

    fn request(role: InstanceRole, parent_id: Option<&str>) -> CreateInstanceRequest {
        CreateInstanceRequest {
            role,
            work_dir: "/tmp/w".to_string(),
            initial_prompt: Some("begin".to_string()),
            parent_id: parent_id.map(|s| s.to_string()),
            workspace_mode: WorkspaceMode::Isolated,
        }
    }

    async fn spawn_tree(manager: &InstanceManager) -> (Instance, Instance, Instance) {
        let top = manager.create_instance(request(InstanceRole::Top, None)).await.unwrap();
        let mid = manager
            .create_instance(request(InstanceRole::Mid, Some(&top.id)))
            .await
            .unwrap();
        let leaf = manager
            .create_instance(request(InstanceRole::Leaf, Some(&mid.id)))
            .await
            .unwrap();
        (top, mid, leaf)
    }

    #[tokio::test]
    async fn test_create_valid_hierarchy() {
        let (manager, transport) = manager();
        let (top, mid, leaf) = spawn_tree(&manager).await;

        assert_eq!(top.status, InstanceStatus::Active);
        assert_eq!(mid.parent_id.as_deref(), Some(top.id.as_str()));
        assert_eq!(leaf.role, InstanceRole::Leaf);
        assert_eq!(transport.live_session_count(), 3);

        // Initial prompt was delivered.
        let handle = SessionHandle(top.session_id.clone().unwrap());
        assert_eq!(transport.sent_keys(&handle), vec![("begin".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_hierarchy_before_side_effects() {
        let (manager, transport) = manager();
        let top = manager.create_instance(request(InstanceRole::Top, None)).await.unwrap();

        let err = manager
            .create_instance(request(InstanceRole::Leaf, Some(&top.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Hierarchy(_)));
        // No extra session was allocated for the rejected request.
        assert_eq!(transport.live_session_count(), 1);
    }

    #[tokio::test]
    async fn test_skip_level_flag_allows_top_to_leaf() {
        let (manager, _) = manager_with(LifecycleConfig {
            allow_skip_level: true,
            readiness_backoff: Duration::from_millis(1),
            persist_backoff: Duration::from_millis(1),
            ..Default::default()
        });
        let top = manager.create_instance(request(InstanceRole::Top, None)).await.unwrap();
        let leaf = manager
            .create_instance(request(InstanceRole::Leaf, Some(&top.id)))
            .await
            .unwrap();
        assert_eq!(leaf.role, InstanceRole::Leaf);
    }

    #[tokio::test]
    async fn test_spawn_timeout_marks_failed_and_releases_session() {
        let (manager, transport) = manager_with(LifecycleConfig {
            readiness_attempts: 2,
            readiness_backoff: Duration::from_millis(1),
            persist_backoff: Duration::from_millis(1),
            ..Default::default()
        });
        transport.set_silent_start(true);

        let err = manager
            .create_instance(request(InstanceRole::Top, None))
            .await
            .unwrap_err();
        let instance_id = match err {
            OrchestratorError::SpawnTimeout { instance_id, attempts } => {
                assert_eq!(attempts, 2);
                instance_id
            }
            other => panic!("unexpected error: {:?}", other),
        };

        let record = manager.get_instance(&instance_id).await.unwrap();
        assert_eq!(record.status, InstanceStatus::Failed);
        assert_eq!(transport.live_session_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (manager, _) = manager();
        let top = manager.create_instance(request(InstanceRole::Top, None)).await.unwrap();

        let first = manager.terminate_instance(&top.id).await.unwrap();
        assert_eq!(first.status, InstanceStatus::Terminated);
        assert!(first.session_id.is_none());

        // Second call succeeds with no error.
        let second = manager.terminate_instance(&top.id).await.unwrap();
        assert_eq!(second.status, InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_cascades_to_descendants() {
        let (manager, transport) = manager();
        let (top, mid, leaf) = spawn_tree(&manager).await;

        manager.terminate_instance(&top.id).await.unwrap();

        for id in [&top.id, &mid.id, &leaf.id] {
            let record = manager.get_instance(id).await.unwrap();
            assert_eq!(record.status, InstanceStatus::Terminated, "{} not terminated", id);
        }
        assert_eq!(transport.live_session_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_orphan_policy_leaves_children() {
        let (manager, _) = manager();
        let (top, mid, leaf) = spawn_tree(&manager).await;

        manager
            .terminate_with_policy(&top.id, TerminationPolicy::Orphan)
            .await
            .unwrap();

        assert_eq!(
            manager.get_instance(&mid.id).await.unwrap().status,
            InstanceStatus::Active
        );
        assert_eq!(
            manager.get_instance(&leaf.id).await.unwrap().status,
            InstanceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_list_instances_filtered_and_restartable() {
        let (manager, _) = manager();
        let (_, mid, _) = spawn_tree(&manager).await;

        let leaves: Vec<Instance> = manager
            .list_instances(InstanceFilter {
                role: Some(InstanceRole::Leaf),
                ..Default::default()
            })
            .collect::<Result<Vec<_>, _>>()
            .await
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].parent_id.as_deref(), Some(mid.id.as_str()));

        // The sequence is restartable: a fresh call scans from the start.
        let all: Vec<Instance> = manager
            .list_instances(InstanceFilter::default())
            .collect::<Result<Vec<_>, _>>()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_get_instance_not_found() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.get_instance("missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
