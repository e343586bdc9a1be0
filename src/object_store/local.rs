//! Directory-backed object store.
//!
//! Each key maps to a file below the root. Writes go through a temporary
//! sibling file and a rename, so readers never observe a partially written
//! object.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

use super::ObjectStore;

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid object key: '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry
                    .with_context(|| format!("Failed to walk store: {}", root.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with(".tmp-") {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root)?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .context("object path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to store object '{}'", key));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object '{}'", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete object '{}'", key))
            }
        }

        // Prune directories left empty, stopping at the root.
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }
}
