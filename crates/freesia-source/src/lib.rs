//! Content-addressed script source storage.
//!
//! Script sources are keyed by the sha256 hex digest of their text: writing
//! the same content twice yields the same hash, and a hash can never point
//! at anything but the content it was derived from. The [`SourceStore`]
//! trait has a filesystem implementation ([`FsSourceStore`]) and an
//! in-memory one ([`MemorySourceStore`]) for tests and embedding.

mod fs;
mod memory;

pub use fs::FsSourceStore;
pub use memory::MemorySourceStore;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Error type for source storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The hash is not a hex digest and cannot name a source.
  #[error("invalid object hash '{hash}'")]
  InvalidHash { hash: String },

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// A stored source, as listed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceEntry {
  pub hash: String,
  pub path: String,
}

/// Compute the object hash of source text: the sha256 hex digest.
pub fn content_hash(content: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(content.as_bytes());
  let digest = hasher.finalize();
  digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Storage trait for script sources.
#[async_trait]
pub trait SourceStore: Send + Sync {
  /// Read the source text for an object hash.
  async fn read_by_hash(&self, hash: &str) -> Result<Option<String>, Error>;

  /// Store source text and return its object hash.
  async fn write(&self, content: &str) -> Result<String, Error>;

  /// Check whether a source exists for an object hash.
  async fn exists_by_hash(&self, hash: &str) -> Result<bool, Error>;

  /// List all stored sources.
  async fn list(&self) -> Result<Vec<SourceEntry>, Error>;
}

pub(crate) fn validate_hash(hash: &str) -> Result<(), Error> {
  if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(Error::InvalidHash {
      hash: hash.to_string(),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_content_hash_is_stable() {
    let a = content_hash("return 1");
    let b = content_hash("return 1");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
  }

  #[test]
  fn test_content_hash_differs_by_content() {
    assert_ne!(content_hash("return 1"), content_hash("return 2"));
  }

  #[test]
  fn test_validate_hash_rejects_non_hex() {
    assert!(validate_hash("abc123").is_ok());
    assert!(validate_hash("../escape").is_err());
    assert!(validate_hash("").is_err());
  }
}
