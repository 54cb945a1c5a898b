//! # In-memory storage backend
//!
//! Keeps every scope in an ordered map behind a shared mutex. Clones share
//! the same data, which lets a test restart a router against the "same"
//! persistent store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::storage::ListOptions;
use crate::storage::Result;
use crate::storage::StorageBackend;

#[derive(Default)]
struct Tables {
    scopes: HashMap<String, BTreeMap<String, Bytes>>,
    alarms: HashMap<String, u64>,
}

/// Process-local [`StorageBackend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored under `scope`.
    pub fn key_count(&self, scope: &str) -> usize {
        self.tables
            .lock()
            .scopes
            .get(scope)
            .map_or(0, BTreeMap::len)
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("MemoryBackend")
            .field("scopes", &tables.scopes.len())
            .field("alarms", &tables.alarms.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Bytes>> {
        let tables = self.tables.lock();
        Ok(tables.scopes.get(scope).and_then(|map| map.get(key)).cloned())
    }

    async fn put(&self, scope: &str, key: &str, value: Bytes) -> Result<()> {
        self.tables
            .lock()
            .scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        let Some(map) = tables.scopes.get_mut(scope) else {
            return Ok(false);
        };
        let existed = map.remove(key).is_some();
        if map.is_empty() {
            tables.scopes.remove(scope);
        }
        Ok(existed)
    }

    async fn delete_all(&self, scope: &str) -> Result<()> {
        self.tables.lock().scopes.remove(scope);
        Ok(())
    }

    async fn list(&self, scope: &str, options: &ListOptions) -> Result<Vec<(String, Bytes)>> {
        let tables = self.tables.lock();
        let Some(map) = tables.scopes.get(scope) else {
            return Ok(Vec::new());
        };

        let lower = match &options.start {
            Some(start) => Bound::Included(start.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &options.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };

        // BTreeMap::range panics on inverted bounds.
        if let (Some(start), Some(end)) = (&options.start, &options.end) {
            if start >= end {
                return Ok(Vec::new());
            }
        }

        let prefix = options.prefix.as_deref().unwrap_or("");
        let matching = map
            .range((lower, upper))
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()));

        let limit = options.limit.unwrap_or(usize::MAX);
        let entries = if options.reverse {
            let mut all: Vec<_> = matching.collect();
            all.reverse();
            all.truncate(limit);
            all
        } else {
            matching.take(limit).collect()
        };

        Ok(entries)
    }

    async fn get_alarm(&self, scope: &str) -> Result<Option<u64>> {
        Ok(self.tables.lock().alarms.get(scope).copied())
    }

    async fn set_alarm(&self, scope: &str, at_ms: u64) -> Result<()> {
        self.tables.lock().alarms.insert(scope.to_string(), at_ms);
        Ok(())
    }

    async fn delete_alarm(&self, scope: &str) -> Result<()> {
        self.tables.lock().alarms.remove(scope);
        Ok(())
    }

    async fn list_alarms(&self) -> Result<Vec<(String, u64)>> {
        let tables = self.tables.lock();
        let mut alarms: Vec<_> = tables
            .alarms
            .iter()
            .map(|(scope, at)| (scope.clone(), *at))
            .collect();
        alarms.sort();
        Ok(alarms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for key in ["user:1", "user:2", "user:3", "room:a", "room:b"] {
            backend.put("s", key, Bytes::from(key.to_uppercase())).await.unwrap();
        }
        backend
    }

    fn keys(entries: Vec<(String, Bytes)>) -> Vec<String> {
        entries.into_iter().map(|(k, _)| k).collect()
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let backend = MemoryBackend::new();
        backend.put("a", "k", Bytes::from_static(b"1")).await.unwrap();
        backend.put("b", "k", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(backend.get("a", "k").await.unwrap().unwrap(), Bytes::from_static(b"1"));
        assert_eq!(backend.get("b", "k").await.unwrap().unwrap(), Bytes::from_static(b"2"));

        backend.delete_all("a").await.unwrap();
        assert!(backend.get("a", "k").await.unwrap().is_none());
        assert!(backend.get("b", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let backend = seeded().await;
        assert!(backend.delete("s", "user:1").await.unwrap());
        assert!(!backend.delete("s", "user:1").await.unwrap());
        assert!(!backend.delete("missing", "user:1").await.unwrap());
        assert_eq!(backend.key_count("s"), 4);
    }

    #[tokio::test]
    async fn test_list_prefix_and_order() {
        let backend = seeded().await;

        let users = backend.list("s", &ListOptions::prefix("user:")).await.unwrap();
        assert_eq!(keys(users), vec!["user:1", "user:2", "user:3"]);

        let reversed = backend
            .list("s", &ListOptions::prefix("user:").reversed().with_limit(2))
            .await
            .unwrap();
        assert_eq!(keys(reversed), vec!["user:3", "user:2"]);
    }

    #[tokio::test]
    async fn test_list_range() {
        let backend = seeded().await;
        let options = ListOptions {
            start: Some("room:b".into()),
            end: Some("user:3".into()),
            ..ListOptions::default()
        };
        let entries = backend.list("s", &options).await.unwrap();
        assert_eq!(keys(entries), vec!["room:b", "user:1", "user:2"]);

        let inverted = ListOptions {
            start: Some("z".into()),
            end: Some("a".into()),
            ..ListOptions::default()
        };
        assert!(backend.list("s", &inverted).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alarm_records() {
        let backend = MemoryBackend::new();
        backend.set_alarm("b", 20).await.unwrap();
        backend.set_alarm("a", 10).await.unwrap();
        backend.set_alarm("a", 15).await.unwrap();

        assert_eq!(backend.get_alarm("a").await.unwrap(), Some(15));
        assert_eq!(
            backend.list_alarms().await.unwrap(),
            vec![("a".to_string(), 15), ("b".to_string(), 20)]
        );

        backend.delete_alarm("a").await.unwrap();
        assert_eq!(backend.get_alarm("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("s", "k", Bytes::from_static(b"v")).await.unwrap();
        assert!(clone.get("s", "k").await.unwrap().is_some());
    }
}
