//! Execution context: the mutable key/value state a run threads through
//! its stages. Values are JSON so action results of any shape can be bound
//! and templates can reach into them with dotted paths.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run-scoped key/value state.
///
/// Writes are journaled so parallel branches can replay their own writes
/// onto the parent in declaration order. The entry cap evicts the oldest
/// binding when a new key would exceed it, keeping long-lived cyclic runs
/// bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    values: HashMap<String, Value>,
    /// Insertion order, oldest first. Drives cap eviction.
    order: VecDeque<String>,
    max_entries: usize,
    #[serde(skip)]
    writes: Vec<(String, Value)>,
}

pub const DEFAULT_MAX_ENTRIES: usize = 256;

impl ExecutionContext {
    pub fn new(max_entries: usize) -> Self {
        Self {
            values: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            writes: Vec::new(),
        }
    }

    pub fn from_map(initial: HashMap<String, Value>, max_entries: usize) -> Self {
        let mut ctx = Self::new(max_entries);
        for (key, value) in initial {
            ctx.set(key, value);
        }
        ctx.writes.clear();
        ctx
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            if self.order.len() >= self.max_entries {
                if let Some(oldest) = self.order.pop_front() {
                    self.values.remove(&oldest);
                }
            }
            self.order.push_back(key.clone());
        }
        self.writes.push((key.clone(), value.clone()));
        self.values.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.order.retain(|k| k != key);
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Dotted-path lookup: `result.status` descends into objects, numeric
    /// segments index arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fork for a parallel branch: same state, empty write journal.
    pub fn fork(&self) -> Self {
        let mut branch = self.clone();
        branch.writes.clear();
        branch
    }

    /// Discard the journal without touching bindings. Called once a stage's
    /// actions have settled so the journal only ever holds in-flight writes.
    pub fn commit_writes(&mut self) {
        self.writes.clear();
    }

    /// Apply branch write journals in declaration order. On key collision
    /// the last-declared branch wins, deterministically.
    pub fn merge_branches(&mut self, branches: Vec<ExecutionContext>) {
        for branch in branches {
            for (key, value) in branch.writes {
                self.set(key, value);
            }
        }
    }

    /// Drop every binding, as when re-entering the blank stage.
    pub fn clear(&mut self) {
        self.values.clear();
        self.order.clear();
        self.writes.clear();
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_path_lookup() {
        let mut ctx = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        ctx.set("result", json!({"status": 200, "items": ["a", "b"]}));

        assert_eq!(ctx.lookup("result.status"), Some(&json!(200)));
        assert_eq!(ctx.lookup("result.items.1"), Some(&json!("b")));
        assert_eq!(ctx.lookup("result.missing"), None);
        assert_eq!(ctx.lookup("absent"), None);
    }

    #[test]
    fn test_entry_cap_evicts_oldest() {
        let mut ctx = ExecutionContext::new(3);
        ctx.set("a", json!(1));
        ctx.set("b", json!(2));
        ctx.set("c", json!(3));
        ctx.set("a", json!(10)); // overwrite, no eviction
        ctx.set("d", json!(4)); // new key evicts the oldest ("a")

        assert_eq!(ctx.len(), 3);
        assert!(!ctx.contains_key("a"));
        assert!(ctx.contains_key("d"));
    }

    #[test]
    fn test_branch_merge_is_declaration_ordered() {
        let mut parent = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        parent.set("base", json!("kept"));

        let mut first = parent.fork();
        first.set("shared", json!("from-first"));
        first.set("only_first", json!(1));

        let mut second = parent.fork();
        second.set("shared", json!("from-second"));

        parent.merge_branches(vec![first, second]);

        assert_eq!(parent.get("shared"), Some(&json!("from-second")));
        assert_eq!(parent.get("only_first"), Some(&json!(1)));
        assert_eq!(parent.get("base"), Some(&json!("kept")));
    }

    #[test]
    fn test_fork_does_not_replay_parent_writes() {
        let mut parent = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        parent.set("pre", json!("x"));

        let branch = parent.fork();
        let mut other = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        other.merge_branches(vec![branch]);

        // Only writes made after the fork travel with the branch.
        assert!(other.is_empty());
    }

    #[test]
    fn test_commit_writes_keeps_bindings_but_empties_journal() {
        let mut ctx = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        ctx.set("stage_result", json!("ok"));
        ctx.commit_writes();
        ctx.set("later", json!(1));

        let mut other = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        other.merge_branches(vec![ctx.clone()]);

        // Committed writes stay readable locally but no longer replay.
        assert_eq!(ctx.get("stage_result"), Some(&json!("ok")));
        assert_eq!(other.get("later"), Some(&json!(1)));
        assert!(!other.contains_key("stage_result"));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut ctx = ExecutionContext::new(DEFAULT_MAX_ENTRIES);
        ctx.set("task", json!("compare"));
        ctx.set("attempt", json!(2));

        let serialized = serde_json::to_string(&ctx).unwrap();
        let restored: ExecutionContext = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.get("task"), Some(&json!("compare")));
        assert_eq!(restored.get("attempt"), Some(&json!(2)));
    }
}
