//! Minimal blob storage used to publish checkpoints.
//!
//! Checkpoint replication only needs four operations on a flat key space,
//! so the abstraction stays that small. Keys are `/`-separated and never
//! start with `/`.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`s3::S3ObjectStore`] | S3 and S3-compatible services (MinIO, LocalStack) |
//! | [`local::LocalObjectStore`] | A shared directory; single-host deployments and tests |

pub mod local;
pub mod s3;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::CheckpointConfig;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket` or `file:///mnt/store`.
    fn location(&self) -> String;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove `key`. Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the store described by `[checkpoint]`, if any.
pub fn from_config(config: &CheckpointConfig) -> Result<Option<Arc<dyn ObjectStore>>> {
    if let Some(s3) = &config.s3 {
        let store = S3ObjectStore::from_env(s3.clone(), config.transfer_timeout())?;
        return Ok(Some(Arc::new(store)));
    }
    if let Some(local) = &config.local {
        return Ok(Some(Arc::new(LocalObjectStore::new(&local.root)?)));
    }
    Ok(None)
}
