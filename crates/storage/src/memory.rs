use std::collections::HashMap;

use tokio::sync::RwLock;

use super::error::StorageResult;
use super::{BoxFuture, KvStore};

/// Process-local backend, used for `:memory:` databases and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.write().await.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("theme").await.unwrap(), None);

        store.set("theme", "\"dark\"".to_string()).await.unwrap();
        assert_eq!(store.get("theme").await.unwrap().as_deref(), Some("\"dark\""));
        assert_eq!(store.get("language").await.unwrap(), None);

        store.remove("theme").await.unwrap();
        assert_eq!(store.get("theme").await.unwrap(), None);
        store.remove("theme").await.unwrap();
    }
}
