//! Content-addressable storage and action cache.
//!
//! - [`Digest`]: content hash + size identifying a blob
//! - [`BlobStore`]: the raw key/value storage engine, consumed through a trait
//! - [`CacheGateway`]: digest-level operations used by the dispatcher and the
//!   CAS / action-cache / byte-stream services
//!
//! Entries are immutable once written. Writing an existing key again is a
//! no-op, so concurrent writers of the same content never conflict.

pub mod digest;
pub mod gateway;
pub mod store;

pub use digest::Digest;
pub use gateway::CacheGateway;
pub use store::{BlobStore, InMemoryBlobStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Not found in cache: {0}")]
    NotFound(Digest),

    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("Malformed cache entry {digest}: {source}")]
    Malformed {
        digest: Digest,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}
