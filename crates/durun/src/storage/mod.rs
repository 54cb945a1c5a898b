//! # Per-instance Storage
//!
//! Durability is delegated to an external key-value store, the
//! [`StorageBackend`]. Each live instance receives a [`Storage`] facade
//! scoped to its own id token, so no two instances ever read or write the
//! same logical keys even when they share a backend connection.
//!
//! The backend also holds one alarm timestamp record per scope; the alarm
//! scheduler reloads those records at startup.

pub mod memory;

pub use memory::MemoryBackend;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;

use crate::alarm;
use crate::alarm::AlarmScheduler;
use crate::id::ObjectId;

#[derive(Debug, Clone)]
pub enum Error {
    /// The backing store failed or is unreachable.
    Backend(String),
    /// A stored value was not in the expected encoding.
    Decode { key: String, details: String },
    /// Alarm bookkeeping failed.
    Alarm(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "Storage backend error: {}", msg),
            Self::Decode { key, details } => write!(f, "Value for '{}' is malformed: {}", key, details),
            Self::Alarm(msg) => write!(f, "Alarm error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<alarm::Error> for Error {
    fn from(e: alarm::Error) -> Self {
        Self::Alarm(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Range selection for [`Storage::list`].
///
/// `start` is inclusive, `end` is exclusive. Keys are ordered bytewise.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// The external persistent store.
///
/// Implementations must give read-your-writes consistency within a scope.
/// `scope` is the owning instance's id token.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, scope: &str, key: &str, value: Bytes) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, scope: &str, key: &str) -> Result<bool>;

    async fn delete_all(&self, scope: &str) -> Result<()>;

    async fn list(&self, scope: &str, options: &ListOptions) -> Result<Vec<(String, Bytes)>>;

    /// Alarm record, in milliseconds since the Unix epoch.
    async fn get_alarm(&self, scope: &str) -> Result<Option<u64>>;

    async fn set_alarm(&self, scope: &str, at_ms: u64) -> Result<()>;

    async fn delete_alarm(&self, scope: &str) -> Result<()>;

    /// Every persisted alarm record, used to rebuild the schedule at startup.
    async fn list_alarms(&self) -> Result<Vec<(String, u64)>>;
}

/// Storage handle owned by a single instance.
#[derive(Clone)]
pub struct Storage {
    id: ObjectId,
    scope: Arc<str>,
    backend: Arc<dyn StorageBackend>,
    alarms: Arc<AlarmScheduler>,
}

impl Storage {
    pub(crate) fn new(id: ObjectId, backend: Arc<dyn StorageBackend>, alarms: Arc<AlarmScheduler>) -> Self {
        let scope = Arc::from(id.to_string());
        Self {
            id,
            scope,
            backend,
            alarms,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.backend.get(&self.scope, key).await
    }

    /// Reads a UTF-8 value.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let Some(bytes) = self.get(key).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| Error::Decode {
                key: key.to_string(),
                details: e.to_string(),
            })
    }

    /// Reads several keys; missing keys are omitted from the result.
    pub async fn get_many(&self, keys: &[&str]) -> Result<Vec<(String, Bytes)>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.push((key.to_string(), value));
            }
        }
        Ok(found)
    }

    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.backend.put(&self.scope, key, value.into()).await
    }

    pub async fn put_many<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: Into<Bytes>,
    {
        for (key, value) in entries {
            self.put(key.as_ref(), value).await?;
        }
        Ok(())
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(&self.scope, key).await
    }

    /// Returns how many of the keys existed.
    pub async fn delete_many(&self, keys: &[&str]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Removes every key and the pending alarm for this instance.
    pub async fn delete_all(&self) -> Result<()> {
        self.backend.delete_all(&self.scope).await?;
        self.alarms.cancel_alarm(&self.id).await?;
        Ok(())
    }

    pub async fn list(&self, options: &ListOptions) -> Result<Vec<(String, Bytes)>> {
        self.backend.list(&self.scope, options).await
    }

    pub fn get_alarm(&self) -> Option<SystemTime> {
        self.alarms.get_alarm(&self.id)
    }

    /// Schedules this instance's alarm, replacing any earlier one.
    pub async fn set_alarm(&self, at: SystemTime) -> Result<()> {
        self.alarms.set_alarm(&self.id, at).await?;
        Ok(())
    }

    pub async fn delete_alarm(&self) -> Result<()> {
        self.alarms.cancel_alarm(&self.id).await?;
        Ok(())
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("scope", &self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::UNIX_EPOCH;

    use super::*;

    fn storage(backend: &MemoryBackend) -> Storage {
        let shared: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        let alarms = Arc::new(AlarmScheduler::new(shared.clone(), Duration::from_millis(10)));
        Storage::new(ObjectId::from_name("store", "a"), shared, alarms)
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend);

        storage.put_many([("a", "1"), ("b", "2"), ("c", "3")]).await.unwrap();
        let found = storage.get_many(&["a", "missing", "c"]).await.unwrap();
        assert_eq!(
            found,
            vec![
                ("a".to_string(), Bytes::from_static(b"1")),
                ("c".to_string(), Bytes::from_static(b"3")),
            ]
        );

        assert_eq!(storage.delete_many(&["a", "b", "missing"]).await.unwrap(), 2);
        assert_eq!(storage.delete_many(&["a"]).await.unwrap(), 0);
        assert_eq!(storage.get_string("c").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_alarm_set_and_delete() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend);
        let scope = storage.scope.to_string();
        assert!(storage.get_alarm().is_none());

        let at = UNIX_EPOCH + Duration::from_secs(1_000);
        storage.set_alarm(at).await.unwrap();
        assert_eq!(storage.get_alarm(), Some(at));
        assert_eq!(backend.get_alarm(&scope).await.unwrap(), Some(1_000_000));

        storage.delete_alarm().await.unwrap();
        assert!(storage.get_alarm().is_none());
        assert!(backend.get_alarm(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_all_clears_keys_and_alarm() {
        let backend = MemoryBackend::new();
        let storage = storage(&backend);
        let scope = storage.scope.to_string();

        storage.put_many([("a", "1"), ("b", "2")]).await.unwrap();
        storage.set_alarm(UNIX_EPOCH + Duration::from_secs(1_000)).await.unwrap();

        storage.delete_all().await.unwrap();
        assert_eq!(backend.key_count(&scope), 0);
        assert!(storage.list(&ListOptions::default()).await.unwrap().is_empty());
        assert!(storage.get_alarm().is_none());
        assert!(backend.get_alarm(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_string_is_a_decode_error() {
        let storage = storage(&MemoryBackend::new());
        storage.put("raw", Bytes::from_static(&[0xff, 0xfe])).await.unwrap();
        assert!(matches!(
            storage.get_string("raw").await,
            Err(Error::Decode { ref key, .. }) if key == "raw"
        ));
    }
}
