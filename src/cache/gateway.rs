use std::sync::Arc;

use crate::action::{Action, ActionResult};
use crate::cache::{BlobStore, CacheError, Digest};

const CAS_PREFIX: &str = "cas/";
const AC_PREFIX: &str = "ac/";

/// Digest-level façade over a [`BlobStore`].
///
/// Blobs live under `cas/<hash>/<size>`, action results under `ac/<hash>` of the
/// action digest, encoded as JSON.
#[derive(Clone)]
pub struct CacheGateway {
    store: Arc<dyn BlobStore>,
}

impl CacheGateway {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    fn cas_key(digest: &Digest) -> String {
        format!("{}{}/{}", CAS_PREFIX, digest.hash, digest.size_bytes)
    }

    fn ac_key(digest: &Digest) -> String {
        format!("{}{}", AC_PREFIX, digest.hash)
    }

    pub async fn contains_blob(&self, digest: &Digest) -> Result<bool, CacheError> {
        if digest.size_bytes == 0 && *digest == Digest::empty() {
            return Ok(true);
        }
        self.store.contains(&Self::cas_key(digest)).await
    }

    /// Digests from `digests` that are not present in the CAS, in input order.
    pub async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, CacheError> {
        let mut missing = Vec::new();
        for digest in digests {
            if !self.contains_blob(digest).await? {
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }

    pub async fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        if digest.size_bytes == 0 && *digest == Digest::empty() {
            return Ok(Vec::new());
        }
        self.store
            .get(&Self::cas_key(digest))
            .await?
            .ok_or_else(|| CacheError::NotFound(digest.clone()))
    }

    /// Store `data` and return its digest.
    pub async fn put_blob(&self, data: Vec<u8>) -> Result<Digest, CacheError> {
        let digest = Digest::of(&data);
        self.store.put(&Self::cas_key(&digest), data).await?;
        Ok(digest)
    }

    /// Store `data` under a digest supplied by a client, rejecting content
    /// that doesn't hash to it.
    pub async fn put_blob_verified(&self, expected: &Digest, data: Vec<u8>) -> Result<(), CacheError> {
        let actual = Digest::of(&data);
        if actual != *expected {
            return Err(CacheError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.store.put(&Self::cas_key(expected), data).await
    }

    pub async fn get_action_result(&self, action_digest: &Digest) -> Result<ActionResult, CacheError> {
        let bytes = self
            .store
            .get(&Self::ac_key(action_digest))
            .await?
            .ok_or_else(|| CacheError::NotFound(action_digest.clone()))?;
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Malformed {
            digest: action_digest.clone(),
            source,
        })
    }

    /// Like [`get_action_result`](Self::get_action_result) but a miss is `Ok(None)`.
    pub async fn lookup_action_result(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>, CacheError> {
        match self.get_action_result(action_digest).await {
            Ok(result) => Ok(Some(result)),
            Err(CacheError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put_action_result(
        &self,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(result).map_err(|source| CacheError::Malformed {
            digest: action_digest.clone(),
            source,
        })?;
        self.store.put(&Self::ac_key(action_digest), bytes).await
    }

    /// Fetch and decode an action previously uploaded to the CAS.
    pub async fn get_action(&self, action_digest: &Digest) -> Result<Action, CacheError> {
        let bytes = self.get_blob(action_digest).await?;
        Action::decode(&bytes).map_err(|source| CacheError::Malformed {
            digest: action_digest.clone(),
            source,
        })
    }

    /// Upload an action's canonical encoding; returns the action digest.
    pub async fn put_action(&self, action: &Action) -> Result<Digest, CacheError> {
        let bytes = action.encode().map_err(|source| CacheError::Malformed {
            digest: Digest::empty(),
            source,
        })?;
        self.put_blob(bytes).await
    }
}

impl std::fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ExecutionMetadata;
    use crate::cache::InMemoryBlobStore;

    fn gateway() -> CacheGateway {
        CacheGateway::new(Arc::new(InMemoryBlobStore::new()))
    }

    fn sample_result() -> ActionResult {
        ActionResult {
            output_files: Vec::new(),
            exit_code: 0,
            stdout_digest: Digest::of(b"out"),
            stderr_digest: Digest::empty(),
            execution_metadata: ExecutionMetadata::default(),
        }
    }

    #[tokio::test]
    async fn put_blob_returns_content_digest() {
        let cache = gateway();
        let digest = cache.put_blob(b"data".to_vec()).await.unwrap();
        assert_eq!(digest, Digest::of(b"data"));
        assert_eq!(cache.get_blob(&digest).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn get_missing_blob_is_not_found() {
        let cache = gateway();
        let err = cache.get_blob(&Digest::of(b"missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn blob_is_keyed_by_hash_and_size() {
        let cache = gateway();
        let stored = cache.put_blob(b"hello".to_vec()).await.unwrap();
        let wrong_size = Digest::new(stored.hash.clone(), 999);

        assert!(!cache.contains_blob(&wrong_size).await.unwrap());
        assert!(cache.get_blob(&wrong_size).await.unwrap_err().is_not_found());
        assert_eq!(cache.get_blob(&stored).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn empty_blob_is_always_present() {
        let cache = gateway();
        assert!(cache.contains_blob(&Digest::empty()).await.unwrap());
        assert!(cache.get_blob(&Digest::empty()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verified_put_rejects_wrong_content() {
        let cache = gateway();
        let err = cache
            .put_blob_verified(&Digest::of(b"one"), b"two".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DigestMismatch { .. }));
        assert!(!cache.contains_blob(&Digest::of(b"one")).await.unwrap());
    }

    #[tokio::test]
    async fn find_missing_preserves_order() {
        let cache = gateway();
        let present = cache.put_blob(b"present".to_vec()).await.unwrap();
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");
        let missing = cache
            .find_missing(&[a.clone(), present, b.clone()])
            .await
            .unwrap();
        assert_eq!(missing, vec![a, b]);
    }

    #[tokio::test]
    async fn action_result_lookup() {
        let cache = gateway();
        let key = Digest::of(b"action");
        assert!(cache.lookup_action_result(&key).await.unwrap().is_none());

        cache.put_action_result(&key, &sample_result()).await.unwrap();
        assert_eq!(cache.get_action_result(&key).await.unwrap(), sample_result());
    }

    #[tokio::test]
    async fn action_upload_and_fetch() {
        let cache = gateway();
        let action = Action::new(["echo", "hi"]);
        let digest = cache.put_action(&action).await.unwrap();
        assert_eq!(digest, action.digest().unwrap());
        assert_eq!(cache.get_action(&digest).await.unwrap(), action);
    }

    #[tokio::test]
    async fn undecodable_action_is_malformed() {
        let cache = gateway();
        let digest = cache.put_blob(b"not json".to_vec()).await.unwrap();
        let err = cache.get_action(&digest).await.unwrap_err();
        assert!(matches!(err, CacheError::Malformed { .. }));
    }
}
