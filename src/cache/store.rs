use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::CacheError;

/// Raw key/value storage behind the cache gateway.
///
/// Implementations must be safe for concurrent use. `put` of an existing key
/// must leave the stored value readable; callers never rely on their write
/// being the one that is kept.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
}

/// Process-local store. Contents are lost when the worker exits.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        // First write wins; later writes carry identical content by construction.
        self.entries.entry(key.to_string()).or_insert(value);
        Ok(())
    }
}
