//! Versioned checkpoints in an object store.
//!
//! A checkpoint is the complete on-disk state of an engine, published under
//! a version-specific prefix:
//!
//! ```text
//! checkpoints/ndb_<v>/<engine files...>
//! checkpoints/ndb_<v>/checkpoint_metadata.json   <- completion marker
//! ```
//!
//! The marker is uploaded strictly after every data object, so a version is
//! *complete* exactly when its marker exists. [`Checkpointer::list`] only
//! reports complete versions. Anything else under `checkpoints/` is either
//! an upload in progress, the debris of a failed one, or not ours.
//!
//! After every successful upload the store is reclaimed: incomplete versions
//! are removed, and only the newest `max_checkpoints` complete versions are
//! kept. Removal deletes the marker first so that a follower listing
//! concurrently stops seeing the version before its data disappears.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndb_core::Source;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::CheckpointConfig;
use crate::object_store::ObjectStore;

pub const CHECKPOINTS_PREFIX: &str = "checkpoints";
pub const MARKER_FILENAME: &str = "checkpoint_metadata.json";

/// A checkpoint version. `Version(0)` is the empty engine that exists before
/// anything has been published.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Directory and key-prefix name, e.g. `ndb_12`.
    pub fn name(&self) -> String {
        format!("ndb_{}", self.0)
    }

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// Local directory holding this version below `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(self.name())
    }

    fn prefix(&self) -> String {
        format!("{}/{}/", CHECKPOINTS_PREFIX, self.name())
    }

    fn marker_key(&self) -> String {
        format!("{}{}", self.prefix(), MARKER_FILENAME)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contents of the completion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub timestamp: DateTime<Utc>,
    pub version: Version,
    /// Document inventory of the engine at publish time.
    pub documents: Vec<Source>,
}

#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Complete versions, ascending.
    async fn list(&self) -> Result<Vec<Version>>;

    /// Fetch every object of `version` into `dest`, recreating relative paths.
    async fn download(&self, version: Version, dest: &Path) -> Result<()>;

    /// Publish the files under `src` as `version`, marker last, then reclaim.
    async fn upload(&self, version: Version, src: &Path, documents: Vec<Source>) -> Result<()>;
}

/// Which version an object key belongs to, and whether it is the marker.
///
/// Only canonical keys match: `checkpoints/ndb_<digits>/<rest>` with no
/// leading zeros.
fn parse_key(key: &str) -> Option<(Version, bool)> {
    let rest = key.strip_prefix(CHECKPOINTS_PREFIX)?.strip_prefix("/ndb_")?;
    let (digits, tail) = rest.split_once('/')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let version = Version(digits.parse().ok()?);
    Some((version, tail == MARKER_FILENAME))
}

async fn with_timeout<T, F>(limit: Duration, what: impl fmt::Display, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => bail!("{} timed out after {}s", what, limit.as_secs()),
    }
}

/// [`Checkpointer`] over any [`ObjectStore`].
pub struct StoreCheckpointer {
    store: Arc<dyn ObjectStore>,
    max_checkpoints: usize,
    list_timeout: Duration,
    transfer_timeout: Duration,
}

impl StoreCheckpointer {
    pub fn new(store: Arc<dyn ObjectStore>, max_checkpoints: usize) -> Self {
        let defaults = CheckpointConfig::default();
        Self {
            store,
            max_checkpoints: max_checkpoints.max(1),
            list_timeout: defaults.list_timeout(),
            transfer_timeout: defaults.transfer_timeout(),
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &CheckpointConfig) -> Self {
        Self::new(store, config.max_checkpoints)
            .with_timeouts(config.list_timeout(), config.transfer_timeout())
    }

    pub fn with_timeouts(mut self, list_timeout: Duration, transfer_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self.transfer_timeout = transfer_timeout;
        self
    }

    /// Read the completion marker of `version`.
    pub async fn metadata(&self, version: Version) -> Result<CheckpointMetadata> {
        let key = version.marker_key();
        let bytes = with_timeout(self.list_timeout, format!("reading {}", key), async {
            self.store.get(&key).await
        })
        .await?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse checkpoint marker {}", key))
    }

    /// Delete incomplete versions and all but the newest `max_checkpoints`
    /// complete ones. Returns the versions removed, oldest first.
    pub async fn reclaim(&self) -> Result<Vec<Version>> {
        let keys = with_timeout(self.list_timeout, "listing checkpoints", async {
            self.store.list(&format!("{}/", CHECKPOINTS_PREFIX)).await
        })
        .await?;

        let mut versions: BTreeMap<Version, (Vec<String>, bool)> = BTreeMap::new();
        for key in keys {
            if let Some((version, is_marker)) = parse_key(&key) {
                let entry = versions.entry(version).or_default();
                entry.1 |= is_marker;
                entry.0.push(key);
            }
        }

        let complete: Vec<Version> = versions
            .iter()
            .filter(|(_, (_, complete))| *complete)
            .map(|(v, _)| *v)
            .collect();
        let surplus = complete.len().saturating_sub(self.max_checkpoints);
        let retired = &complete[..surplus];

        let mut removed = Vec::new();
        for (version, (keys, complete)) in versions {
            if complete && !retired.contains(&version) {
                continue;
            }
            self.delete_version(version, keys).await?;
            if complete {
                tracing::info!(version = %version, "retired checkpoint");
            } else {
                tracing::warn!(version = %version, "deleted incomplete checkpoint");
            }
            removed.push(version);
        }

        Ok(removed)
    }

    async fn delete_version(&self, version: Version, mut keys: Vec<String>) -> Result<()> {
        let marker = version.marker_key();
        // Marker first.
        keys.sort_by_key(|k| *k != marker);

        with_timeout(self.transfer_timeout, format!("deleting checkpoint {}", version), async {
            for key in &keys {
                self.store
                    .delete(key)
                    .await
                    .with_context(|| format!("Failed to delete {} of checkpoint {}", key, version))?;
            }
            Ok(())
        })
        .await
    }
}

/// Regular files below `src` with their `/`-separated relative paths.
fn collect_files(src: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src)?;
        let rel_key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), rel_key));
    }
    Ok(files)
}

#[async_trait]
impl Checkpointer for StoreCheckpointer {
    async fn list(&self) -> Result<Vec<Version>> {
        let keys = with_timeout(self.list_timeout, "listing checkpoints", async {
            self.store.list(&format!("{}/", CHECKPOINTS_PREFIX)).await
        })
        .await
        .with_context(|| format!("Failed to list checkpoints in {}", self.store.location()))?;

        let mut versions: Vec<Version> = keys
            .iter()
            .filter_map(|k| parse_key(k))
            .filter(|(_, is_marker)| *is_marker)
            .map(|(v, _)| v)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn download(&self, version: Version, dest: &Path) -> Result<()> {
        tracing::info!(version = %version, dest = %dest.display(), "downloading checkpoint");
        let prefix = version.prefix();

        with_timeout(self.transfer_timeout, format!("downloading checkpoint {}", version), async {
            let keys = self.store.list(&prefix).await?;
            if keys.is_empty() {
                bail!("checkpoint {} not found in {}", version, self.store.location());
            }

            for key in keys {
                let rel = key.strip_prefix(&prefix).unwrap_or(&key);
                let rel_path = Path::new(rel);
                if rel.is_empty() {
                    continue;
                }
                if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
                    bail!("refusing to download unsafe key {}", key);
                }

                let local = dest.join(rel_path);
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let bytes = self
                    .store
                    .get(&key)
                    .await
                    .with_context(|| format!("Failed to download {}", key))?;
                tokio::fs::write(&local, bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", local.display()))?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(version = %version, "checkpoint download successful");
        Ok(())
    }

    async fn upload(&self, version: Version, src: &Path, documents: Vec<Source>) -> Result<()> {
        tracing::info!(version = %version, src = %src.display(), "uploading checkpoint");
        let prefix = version.prefix();

        let src_owned = src.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&src_owned)).await??;

        // Leftovers of an interrupted attempt at this version would otherwise
        // become part of it once the marker lands.
        let stale = with_timeout(self.list_timeout, format!("listing {}", prefix), async {
            self.store.list(&prefix).await
        })
        .await?;
        if !stale.is_empty() {
            tracing::warn!(version = %version, objects = stale.len(), "clearing leftovers of an earlier upload");
            self.delete_version(version, stale).await?;
        }

        with_timeout(self.transfer_timeout, format!("uploading checkpoint {}", version), async {
            for (path, rel_key) in &files {
                if rel_key == MARKER_FILENAME {
                    continue;
                }
                let body = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let key = format!("{}{}", prefix, rel_key);
                self.store
                    .put(&key, body)
                    .await
                    .with_context(|| format!("Failed to upload {}", key))?;
            }

            let metadata = CheckpointMetadata {
                timestamp: Utc::now(),
                version,
                documents,
            };
            let marker = serde_json::to_vec_pretty(&metadata)?;
            self.store
                .put(&version.marker_key(), marker)
                .await
                .with_context(|| format!("Failed to upload marker of checkpoint {}", version))
        })
        .await?;

        tracing::info!(version = %version, files = files.len(), "checkpoint upload successful");

        match self.reclaim().await {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(removed = ?removed, "reclaimed checkpoint storage");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to reclaim old checkpoints"),
        }

        Ok(())
    }
}
