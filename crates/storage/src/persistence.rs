use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{DeserializeValueSnafu, SerializeValueSnafu, StorageResult};
use super::keys::StorageKey;
use super::memory::MemoryStore;
use super::KvStore;

/// Typed access to the key scheme on top of a raw [`KvStore`].
///
/// Writes to one key are serialized: a second writer waits until the first
/// has settled. Reads never take a write lock, so a slow write to one key
/// does not hold up reads of any key.
pub struct Persistence {
    backend: Arc<dyn KvStore>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            backend,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn load<T>(&self, key: &StorageKey) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let raw_key = key.as_string();
        let Some(raw) = self.backend.get(&raw_key).await? else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw).context(DeserializeValueSnafu {
            stage: "persistence-load",
            key: raw_key,
        })?;
        Ok(Some(value))
    }

    /// Loads a value, retrying the backend read once before giving up.
    pub async fn load_with_retry<T>(&self, key: &StorageKey) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        retry_once("persistence-load", key, || self.load(key)).await
    }

    pub async fn store<T>(&self, key: &StorageKey, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let raw_key = key.as_string();
        let payload = serde_json::to_string(value).context(SerializeValueSnafu {
            stage: "persistence-store",
            key: raw_key.clone(),
        })?;

        self.serialized(&raw_key, || self.backend.set(&raw_key, payload.clone()))
            .await
    }

    /// Stores a value, retrying the backend write once before giving up.
    pub async fn store_with_retry<T>(&self, key: &StorageKey, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        retry_once("persistence-store", key, || self.store(key, value)).await
    }

    pub async fn remove(&self, key: &StorageKey) -> StorageResult<()> {
        let raw_key = key.as_string();
        self.serialized(&raw_key, || self.backend.remove(&raw_key))
            .await
    }

    pub async fn remove_with_retry(&self, key: &StorageKey) -> StorageResult<()> {
        retry_once("persistence-remove", key, || self.remove(key)).await
    }

    async fn serialized<F, Fut>(&self, raw_key: &str, write: F) -> StorageResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<()>>,
    {
        let lock = self.write_lock(raw_key);
        let result = {
            let _guard = lock.lock().await;
            write().await
        };
        self.release_write_lock(raw_key, lock);
        result
    }

    fn write_lock(&self, raw_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(raw_key.to_string())
            .or_default()
            .clone()
    }

    fn release_write_lock(&self, raw_key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.write_locks.lock();
        drop(lock);
        // Clones are only taken and dropped under the table lock, so a single
        // remaining reference means no writer is queued on this key.
        if locks
            .get(raw_key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(raw_key);
        }
    }
}

async fn retry_once<T, F, Fut>(stage: &'static str, key: &StorageKey, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(error) => {
            tracing::warn!(stage, key = %key, error = %error, "storage operation failed; retrying once");
            op().await.inspect_err(|error| {
                tracing::error!(stage, key = %key, error = %error, "storage operation failed after retry");
            })
        }
    }
}
