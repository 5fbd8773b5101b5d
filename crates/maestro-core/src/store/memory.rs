//! In-memory store implementation.
//!
//! Satisfies [`KvStore`] with the same semantics as [`super::SqliteStore`],
//! including sorted prefix listing and compare-and-swap. Used by the test
//! suite and by embedders that do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::store::KvStore;

#[derive(Default)]
struct MemoryInner {
    kv: BTreeMap<String, String>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, OrchestratorError> {
        self.inner
            .lock()
            .map_err(|e| OrchestratorError::Store(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        self.lock()?.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError> {
        self.lock()?.kv.remove(key);
        Ok(())
    }

    async fn list_keys(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, OrchestratorError> {
        let inner = self.lock()?;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .skip(offset)
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, OrchestratorError> {
        let mut inner = self.lock()?;
        let current = inner.kv.get(key).map(|s| s.as_str());
        if current == expected {
            inner.kv.insert(key.to_string(), new.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, OrchestratorError> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), OrchestratorError> {
        self.lock()?
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), OrchestratorError> {
        if let Some(h) = self.lock()?.hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hfields(&self, key: &str) -> Result<Vec<(String, String)>, OrchestratorError> {
        Ok(self
            .lock()?
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_is_sorted_and_restartable() {
        let s = MemoryStore::new();
        s.set("instance:b", "1").await.unwrap();
        s.set("instance:a", "1").await.unwrap();
        s.set("instance:c", "1").await.unwrap();
        s.set("other:z", "1").await.unwrap();

        let first = s.list_keys("instance:", 0, 2).await.unwrap();
        assert_eq!(first, vec!["instance:a", "instance:b"]);
        // Restart from an offset rather than holding a cursor.
        let rest = s.list_keys("instance:", 2, 10).await.unwrap();
        assert_eq!(rest, vec!["instance:c"]);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_writer() {
        let s = MemoryStore::new();
        s.set("rec", "v1").await.unwrap();
        assert!(s.compare_and_swap("rec", Some("v1"), "v2").await.unwrap());
        // A second writer still holding v1 must not clobber v2.
        assert!(!s.compare_and_swap("rec", Some("v1"), "v3").await.unwrap());
        assert_eq!(s.get("rec").await.unwrap().as_deref(), Some("v2"));
    }
}
