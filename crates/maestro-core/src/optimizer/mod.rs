//! Resource and performance layer over the lifecycle manager.
//!
//! Three independent optimizations, all opt-in per call:
//!   - batched spawning with bounded concurrency and per-request failure
//!     isolation (one bad request never aborts the batch)
//!   - a pre-warmed pool of ready instance slots consumed before cold
//!     creation
//!   - an explicit-key memo cache for idempotent reads, invalidated by the
//!     caller on mutation (no implicit expiry)
//!
//! A read-only metrics snapshot covers all three.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};

use crate::error::OrchestratorError;
use crate::lifecycle::{CreateInstanceRequest, InstanceManager};
use crate::models::{Instance, InstanceRole, WorkspaceMode};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pre-warmed slots held at once.
    pub max_slots: usize,
    /// Concurrency bound for batch spawning.
    pub batch_concurrency: usize,
    /// Working directory pooled slots are rooted in.
    pub pool_work_dir: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            batch_concurrency: 4,
            pool_work_dir: ".".to_string(),
        }
    }
}

/// One outcome of a batch spawn, tagged with its position in the request
/// list so callers can correlate results after partial failure.
#[derive(Debug)]
pub struct BatchOutcome {
    pub index: usize,
    pub result: Result<Instance, OrchestratorError>,
}

/// A pre-provisioned ready instance slot.
struct PooledSlot {
    instance: Instance,
    role: InstanceRole,
    workspace_mode: WorkspaceMode,
}

#[derive(Default)]
struct MetricsInner {
    spawns_total: AtomicU64,
    spawn_failures: AtomicU64,
    pool_hits: AtomicU64,
    cold_spawns: AtomicU64,
    batches: AtomicU64,
    largest_batch: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    spawn_latency_ms_total: AtomicU64,
}

/// Read-only metrics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub spawns_total: u64,
    pub spawn_failures: u64,
    pub pool_hits: u64,
    pub cold_spawns: u64,
    pub batches: u64,
    pub largest_batch: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_spawn_latency_ms: u64,
}

/// The optimizer wraps an [`InstanceManager`]; everything it spawns is a
/// real, persisted instance.
pub struct Optimizer {
    manager: Arc<InstanceManager>,
    config: PoolConfig,
    pool: Mutex<Vec<PooledSlot>>,
    batch_gate: Arc<Semaphore>,
    cache: Mutex<HashMap<String, String>>,
    metrics: MetricsInner,
}

impl Optimizer {
    pub fn new(manager: Arc<InstanceManager>, config: PoolConfig) -> Self {
        let batch_gate = Arc::new(Semaphore::new(config.batch_concurrency.max(1)));
        Self {
            manager,
            config,
            pool: Mutex::new(Vec::new()),
            batch_gate,
            cache: Mutex::new(HashMap::new()),
            metrics: MetricsInner::default(),
        }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    // ── Spawning ───────────────────────────────────────────────────────

    /// Spawn one instance, consuming a matching pool slot when available.
    pub async fn spawn_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<Instance, OrchestratorError> {
        let started = Instant::now();
        let result = match self.claim_pooled(&req).await {
            Some(instance) => {
                self.metrics.pool_hits.fetch_add(1, Ordering::Relaxed);
                self.adopt_pooled(instance, &req).await
            }
            None => {
                self.metrics.cold_spawns.fetch_add(1, Ordering::Relaxed);
                self.manager.create_instance(req).await
            }
        };

        self.metrics.spawns_total.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .spawn_latency_ms_total
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.metrics.spawn_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Spawn a batch. Results come back in input order; each is
    /// independently success-or-error.
    pub async fn spawn_batch(&self, requests: Vec<CreateInstanceRequest>) -> Vec<BatchOutcome> {
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .largest_batch
            .fetch_max(requests.len() as u64, Ordering::Relaxed);

        let mut handles = Vec::with_capacity(requests.len());
        for (index, req) in requests.into_iter().enumerate() {
            let gate = self.batch_gate.clone();
            let fut = async move {
                // Closed only on shutdown; treat as spawn failure then.
                let _permit = match gate.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return BatchOutcome {
                            index,
                            result: Err(OrchestratorError::SpawnFailure(
                                "batch gate closed".to_string(),
                            )),
                        }
                    }
                };
                BatchOutcome {
                    index,
                    result: self.spawn_instance(req).await,
                }
            };
            handles.push(fut);
        }

        // join_all keeps outputs aligned with input order while the
        // semaphore bounds how many run at once.
        futures::future::join_all(handles).await
    }

    // ── Pool ───────────────────────────────────────────────────────────

    /// Proactively create up to `count` ready slots (bounded by
    /// `max_slots`). Slot creation failures are logged, not fatal: a
    /// smaller pool is still a pool.
    pub async fn prewarm_pool(
        &self,
        count: usize,
        role: InstanceRole,
        parent_id: Option<String>,
        workspace_mode: WorkspaceMode,
    ) -> Result<usize, OrchestratorError> {
        let mut created = 0;
        for _ in 0..count {
            {
                let pool = self.pool.lock().await;
                if pool.len() >= self.config.max_slots {
                    break;
                }
            }
            let req = CreateInstanceRequest {
                role,
                work_dir: self.config.pool_work_dir.clone(),
                initial_prompt: None,
                parent_id: parent_id.clone(),
                workspace_mode,
            };
            match self.manager.create_instance(req).await {
                Ok(instance) => {
                    let mut pool = self.pool.lock().await;
                    pool.push(PooledSlot {
                        instance,
                        role,
                        workspace_mode,
                    });
                    created += 1;
                }
                Err(e) => {
                    tracing::warn!("[Optimizer] prewarm slot failed: {}", e);
                }
            }
        }
        tracing::info!("[Optimizer] pre-warmed {} slot(s)", created);
        Ok(created)
    }

    pub async fn pool_size(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Atomically check out a matching slot; no slot is ever issued twice.
    async fn claim_pooled(&self, req: &CreateInstanceRequest) -> Option<Instance> {
        let mut pool = self.pool.lock().await;
        let position = pool.iter().position(|slot| {
            slot.role == req.role
                && slot.workspace_mode == req.workspace_mode
                && slot.instance.parent_id == req.parent_id
        })?;
        Some(pool.swap_remove(position).instance)
    }

    /// Point a claimed slot at the caller's request: deliver the initial
    /// prompt over its already-live session.
    async fn adopt_pooled(
        &self,
        instance: Instance,
        req: &CreateInstanceRequest,
    ) -> Result<Instance, OrchestratorError> {
        if let Some(prompt) = &req.initial_prompt {
            self.manager.send_to_instance(&instance.id, prompt).await?;
        }
        Ok(instance)
    }

    // ── Cache ──────────────────────────────────────────────────────────

    /// Look up a memoized read under an explicit caller-supplied key.
    pub async fn cache_get(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().await;
        match cache.get(key) {
            Some(v) => {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn cache_put(&self, key: &str, value: String) {
        self.cache.lock().await.insert(key.to_string(), value);
    }

    /// Caller-driven invalidation; there is no implicit expiry.
    pub async fn cache_invalidate(&self, key: &str) {
        self.cache.lock().await.remove(key);
    }

    // ── Metrics ────────────────────────────────────────────────────────

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        let spawns = m.spawns_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            spawns_total: spawns,
            spawn_failures: m.spawn_failures.load(Ordering::Relaxed),
            pool_hits: m.pool_hits.load(Ordering::Relaxed),
            cold_spawns: m.cold_spawns.load(Ordering::Relaxed),
            batches: m.batches.load(Ordering::Relaxed),
            largest_batch: m.largest_batch.load(Ordering::Relaxed),
            cache_hits: m.cache_hits.load(Ordering::Relaxed),
            cache_misses: m.cache_misses.load(Ordering::Relaxed),
            avg_spawn_latency_ms: if spawns == 0 {
                0
            } else {
                m.spawn_latency_ms_total.load(Ordering::Relaxed) / spawns
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::lifecycle::{LifecycleConfig, TerminationPolicy};
    use crate::session::{FakeTransport, SessionHandle};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn optimizer() -> (Arc<Optimizer>, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let manager = Arc::new(InstanceManager::new(
            Arc::new(MemoryStore::new()),
            transport.clone(),
            EventBus::new(),
            LifecycleConfig {
                readiness_backoff: Duration::from_millis(1),
                persist_backoff: Duration::from_millis(1),
                persist_attempts: 1,
                termination: TerminationPolicy::Cascade,
                ..Default::default()
            },
        ));
        (
            Arc::new(Optimizer::new(manager, PoolConfig::default())),
            transport,
        )
    }

    fn top_request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            role: InstanceRole::Top,
            work_dir: "/tmp/w".to_string(),
            initial_prompt: None,
            parent_id: None,
            workspace_mode: WorkspaceMode::Isolated,
        }
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failure() {
        let (opt, transport) = optimizer();
        // Fail the third session allocation so only that request errors.
        transport.fail_create_at(2);

        let requests: Vec<_> = (0..5).map(|_| top_request()).collect();
        let outcomes = opt.spawn_batch(requests).await;

        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
        }
        let failures: Vec<usize> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.index)
            .collect();
        assert_eq!(failures, vec![2]);
        assert_eq!(outcomes.iter().filter(|o| o.result.is_ok()).count(), 4);
    }

    #[tokio::test]
    async fn test_pool_hit_then_cold_fallback() {
        let (opt, _) = optimizer();
        let warmed = opt
            .prewarm_pool(1, InstanceRole::Top, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        assert_eq!(warmed, 1);
        assert_eq!(opt.pool_size().await, 1);

        // First spawn consumes the slot, second goes cold.
        let a = opt.spawn_instance(top_request()).await.unwrap();
        assert_eq!(opt.pool_size().await, 0);
        let b = opt.spawn_instance(top_request()).await.unwrap();
        assert_ne!(a.id, b.id);

        let metrics = opt.metrics();
        assert_eq!(metrics.pool_hits, 1);
        assert_eq!(metrics.cold_spawns, 1);
    }

    #[tokio::test]
    async fn test_pooled_slot_delivers_initial_prompt() {
        let (opt, transport) = optimizer();
        opt.prewarm_pool(1, InstanceRole::Top, None, WorkspaceMode::Isolated)
            .await
            .unwrap();

        let mut req = top_request();
        req.initial_prompt = Some("start work".to_string());
        let instance = opt.spawn_instance(req).await.unwrap();

        let handle = SessionHandle(instance.session_id.unwrap());
        assert_eq!(
            transport.sent_keys(&handle),
            vec![("start work".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_prewarm_respects_max_slots() {
        let (opt, _) = optimizer();
        let warmed = opt
            .prewarm_pool(100, InstanceRole::Top, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        assert_eq!(warmed, PoolConfig::default().max_slots);
    }

    #[tokio::test]
    async fn test_cache_counts_hits_and_misses() {
        let (opt, _) = optimizer();
        assert!(opt.cache_get("k").await.is_none());
        opt.cache_put("k", "v".to_string()).await;
        assert_eq!(opt.cache_get("k").await.as_deref(), Some("v"));
        opt.cache_invalidate("k").await;
        assert!(opt.cache_get("k").await.is_none());

        let metrics = opt.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 2);
    }
}
