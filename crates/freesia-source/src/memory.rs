use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{Error, SourceEntry, SourceStore, content_hash, validate_hash};

/// In-memory source store.
///
/// Suitable for tests and embedding. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceStore {
  data: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySourceStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
  async fn read_by_hash(&self, hash: &str) -> Result<Option<String>, Error> {
    validate_hash(hash)?;
    let data = self.data.read().unwrap();
    Ok(data.get(hash).cloned())
  }

  async fn write(&self, content: &str) -> Result<String, Error> {
    let hash = content_hash(content);
    let mut data = self.data.write().unwrap();
    data.insert(hash.clone(), content.to_string());
    Ok(hash)
  }

  async fn exists_by_hash(&self, hash: &str) -> Result<bool, Error> {
    validate_hash(hash)?;
    let data = self.data.read().unwrap();
    Ok(data.contains_key(hash))
  }

  async fn list(&self) -> Result<Vec<SourceEntry>, Error> {
    let data = self.data.read().unwrap();
    let mut sources: Vec<SourceEntry> = data
      .keys()
      .map(|hash| SourceEntry {
        hash: hash.clone(),
        path: format!("{}.lua", hash),
      })
      .collect();

    sources.sort_by(|a, b| a.hash.cmp(&b.hash));
    Ok(sources)
  }
}
