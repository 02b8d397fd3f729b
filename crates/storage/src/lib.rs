use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod keys;
pub mod memory;
pub mod persistence;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId};
pub use keys::StorageKey;
pub use memory::MemoryStore;
pub use persistence::Persistence;
pub use sqlite::SqliteStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw string key-value backend.
///
/// Backends only move opaque strings; typing, the key scheme and write
/// ordering live in [`Persistence`].
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>>;
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>>;
}
