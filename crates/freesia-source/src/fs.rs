use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::{Error, SourceEntry, SourceStore, content_hash, validate_hash};

/// Filesystem-based source store.
///
/// Sources are stored one file per object under the base directory:
/// ```text
/// {base}/
/// ├── 3f7a...c21e.lua
/// └── 9b04...77d0.lua
/// ```
pub struct FsSourceStore {
  base: PathBuf,
}

impl FsSourceStore {
  /// Create a store rooted at the given directory.
  pub fn new(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  /// The base directory sources are stored under.
  pub fn base(&self) -> &Path {
    &self.base
  }

  fn path_for(&self, hash: &str) -> Result<PathBuf, Error> {
    validate_hash(hash)?;
    Ok(self.base.join(format!("{}.lua", hash)))
  }
}

#[async_trait]
impl SourceStore for FsSourceStore {
  async fn read_by_hash(&self, hash: &str) -> Result<Option<String>, Error> {
    let path = self.path_for(hash)?;

    match fs::read_to_string(&path).await {
      Ok(content) => Ok(Some(content)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn write(&self, content: &str) -> Result<String, Error> {
    let hash = content_hash(content);
    let path = self.base.join(format!("{}.lua", hash));

    fs::create_dir_all(&self.base).await?;
    fs::write(&path, content).await?;

    Ok(hash)
  }

  async fn exists_by_hash(&self, hash: &str) -> Result<bool, Error> {
    let path = self.path_for(hash)?;
    Ok(fs::try_exists(&path).await?)
  }

  async fn list(&self) -> Result<Vec<SourceEntry>, Error> {
    let mut sources = Vec::new();

    if !fs::try_exists(&self.base).await? {
      return Ok(sources);
    }

    let mut entries = fs::read_dir(&self.base).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("lua") {
        continue;
      }

      if let Some(hash) = path.file_stem().and_then(|s| s.to_str()) {
        sources.push(SourceEntry {
          hash: hash.to_string(),
          path: path.display().to_string(),
        });
      }
    }

    sources.sort_by(|a, b| a.hash.cmp(&b.hash));
    Ok(sources)
  }
}
