use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Content hash plus size, identifying a blob or an action.
///
/// `hash` is the lowercase hex SHA-256 of the content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: i64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// Compute the digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(data));
        Self {
            hash,
            size_bytes: data.len() as i64,
        }
    }

    /// Digest of the empty blob.
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// A digest is well formed when the hash is 64 lowercase hex characters
    /// and the size is not negative.
    pub fn is_valid(&self) -> bool {
        self.size_bytes >= 0
            && self.hash.len() == 64
            && self
                .hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// True when `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as i64 == self.size_bytes && Digest::of(data).hash == self.hash
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}
