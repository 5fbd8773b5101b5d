//! Shared application state wiring the durable store, the instance
//! manager, the optimizer, and the workflow engine together.

use std::sync::Arc;

use crate::events::EventBus;
use crate::lifecycle::{InstanceManager, LifecycleConfig};
use crate::optimizer::{Optimizer, PoolConfig};
use crate::session::SessionTransport;
use crate::store::{Database, KvStore, SqliteStore};
use crate::tools::OrchestratorTools;
use crate::workflow::{EngineConfig, WorkflowEngine};

/// Shared state accessible by every embedding surface (CLI, server, tests).
pub struct OrchestratorStateInner {
    pub db: Database,
    pub store: Arc<dyn KvStore>,
    pub manager: Arc<InstanceManager>,
    pub optimizer: Arc<Optimizer>,
    pub engine: WorkflowEngine,
    pub tools: OrchestratorTools,
    pub event_bus: EventBus,
}

pub type OrchestratorState = Arc<OrchestratorStateInner>;

impl OrchestratorStateInner {
    pub fn new(db: Database, transport: Arc<dyn SessionTransport>) -> Self {
        Self::with_configs(
            db,
            transport,
            LifecycleConfig::default(),
            PoolConfig::default(),
            EngineConfig::default(),
        )
    }

    pub fn with_configs(
        db: Database,
        transport: Arc<dyn SessionTransport>,
        lifecycle: LifecycleConfig,
        pool: PoolConfig,
        engine: EngineConfig,
    ) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::new(db.clone()));
        let event_bus = EventBus::new();
        let manager = Arc::new(InstanceManager::new(
            store.clone(),
            transport,
            event_bus.clone(),
            lifecycle,
        ));
        let optimizer = Arc::new(Optimizer::new(manager.clone(), pool));
        Self {
            engine: WorkflowEngine::new(optimizer.clone(), store.clone(), engine),
            tools: OrchestratorTools::new(optimizer.clone()),
            db,
            store,
            manager,
            optimizer,
            event_bus,
        }
    }
}
