//! Durable key-value store abstraction.
//!
//! Orchestration state (instance records, run checkpoints) is persisted
//! through the narrow [`KvStore`] capability so the same code runs against
//! an in-process map or a real database. Two implementations ship here:
//!
//! - [`SqliteStore`] — rusqlite-backed, WAL mode, all calls funneled through
//!   `spawn_blocking` so the async runtime never blocks on the connection.
//! - [`MemoryStore`] — in-process map, used by tests and embedders.
//!
//! Per-record write serialization is part of the contract: callers that race
//! on the same record must use [`KvStore::compare_and_swap`] rather than a
//! blind `set`.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{Database, SqliteStore};

use async_trait::async_trait;

use crate::error::OrchestratorError;

/// Key-addressed durable store consumed by the orchestration layers.
///
/// Works identically whether in-process or networked; values are opaque
/// strings (the callers serialize JSON into them).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError>;

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError>;

    /// List keys under a prefix, sorted, bounded by `limit`/`offset` so
    /// callers can page through lazily and restart from any position.
    async fn list_keys(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, OrchestratorError>;

    /// Atomically replace `key`'s value with `new` only if the current value
    /// equals `expected` (`None` = key must be absent). Returns whether the
    /// swap applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, OrchestratorError>;

    // ── Hash-field operations ──────────────────────────────────────────

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, OrchestratorError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), OrchestratorError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), OrchestratorError>;

    async fn hfields(&self, key: &str) -> Result<Vec<(String, String)>, OrchestratorError>;
}
