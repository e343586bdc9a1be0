//! Active version, active engine, and the transitions between checkpoints.
//!
//! [`ServerState`] is constructed once in `main` and shared as
//! `Arc<ServerState>` by the HTTP handlers and the replication loop.
//!
//! # Synchronization
//!
//! - `current_version` is an `AtomicU64`. It is the lock-free read path and
//!   is only ever written inside the `inner` write lock.
//! - `inner` is a `tokio::sync::RwLock` around the engine handle and the
//!   dirty flag. Queries take the read lock; mutations take the write lock.
//!
//! On the leader, [`ServerState::publish_checkpoint`] holds the write lock
//! from the dirty check until the new engine is swapped in, so that no
//! mutation lands between save and swap and overlapping triggers serialize.
//! On a follower, [`ServerState::adopt_latest_checkpoint`] downloads and opens
//! the new checkpoint without any lock and only takes the write lock for the
//! swap itself.
//!
//! At most two local checkpoint directories exist at a time: the live one
//! and the one being prepared. The old directory is removed after the swap.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use ndb_core::{Engine, EngineLoader};
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::checkpoint::{Checkpointer, Version};
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

struct Inner {
    engine: Box<dyn Engine>,
    dirty: bool,
}

/// Exclusive access to the engine for one mutation.
pub struct EngineWriteGuard<'a> {
    inner: RwLockWriteGuard<'a, Inner>,
}

impl EngineWriteGuard<'_> {
    pub fn engine(&mut self) -> &mut dyn Engine {
        &mut *self.inner.engine
    }

    /// Record that the engine changed since the last publish.
    pub fn mark_dirty(&mut self) {
        self.inner.dirty = true;
    }
}

/// Outcome of the most recent publish (leader) or adoption (follower).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastCheckpoint {
    pub version: Version,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointOutcome {
    pub version: Version,
    pub new_checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdoptOutcome {
    pub version: Version,
    pub adopted: bool,
}

pub struct ServerState {
    role: Role,
    current_version: AtomicU64,
    inner: RwLock<Inner>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    loader: Arc<dyn EngineLoader>,
    local_dir: PathBuf,
    last_checkpoint: Mutex<Option<LastCheckpoint>>,
}

impl ServerState {
    /// Restore the latest complete checkpoint (or start empty at version 0).
    ///
    /// A follower must have a checkpointer. A leader without one runs, but
    /// cannot publish.
    pub async fn new(
        role: Role,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        loader: Arc<dyn EngineLoader>,
        local_dir: PathBuf,
    ) -> Result<Self> {
        if role == Role::Follower && checkpointer.is_none() {
            bail!("a follower requires a checkpoint store");
        }

        tokio::fs::create_dir_all(&local_dir)
            .await
            .with_context(|| format!("Failed to create checkpoint directory: {}", local_dir.display()))?;

        let latest = match &checkpointer {
            Some(cp) => cp
                .list()
                .await
                .context("Failed to list checkpoints at startup")?
                .into_iter()
                .max()
                .unwrap_or_default(),
            None => Version(0),
        };

        let dir = latest.local_path(&local_dir);
        remove_dir_if_exists(&dir).await?;
        if let (Some(cp), true) = (&checkpointer, latest > Version(0)) {
            cp.download(latest, &dir).await?;
        }
        let engine = open_engine(loader.clone(), dir).await?;

        tracing::info!(role = ?role, version = %latest, "engine ready");

        Ok(Self {
            role,
            current_version: AtomicU64::new(latest.0),
            inner: RwLock::new(Inner {
                engine,
                dirty: false,
            }),
            checkpointer,
            loader,
            local_dir,
            last_checkpoint: Mutex::new(None),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_version(&self) -> Version {
        Version(self.current_version.load(Ordering::SeqCst))
    }

    pub fn has_checkpointer(&self) -> bool {
        self.checkpointer.is_some()
    }

    pub fn last_checkpoint(&self) -> Option<LastCheckpoint> {
        self.last_checkpoint
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.read().await.dirty
    }

    /// Shared access to the live engine.
    pub async fn engine(&self) -> RwLockReadGuard<'_, dyn Engine> {
        RwLockReadGuard::map(self.inner.read().await, |inner| &*inner.engine)
    }

    /// Exclusive access to the live engine for a mutation named `op`.
    /// Followers get [`ApiError::Forbidden`].
    pub async fn write(&self, op: &str) -> Result<EngineWriteGuard<'_>, ApiError> {
        if !self.is_leader() {
            return Err(ApiError::leader_only(op));
        }
        Ok(EngineWriteGuard {
            inner: self.inner.write().await,
        })
    }

    fn record_checkpoint(&self, version: Version, complete: bool, error: Option<String>) {
        let record = LastCheckpoint {
            version,
            complete,
            error,
        };
        match self.last_checkpoint.lock() {
            Ok(mut guard) => *guard = Some(record),
            Err(poisoned) => *poisoned.into_inner() = Some(record),
        }
    }

    /// Save the engine as the next version, publish it, and switch to it.
    ///
    /// Returns the unchanged version with `new_checkpoint = false` when
    /// nothing changed since the last publish.
    pub async fn publish_checkpoint(&self) -> Result<CheckpointOutcome, ApiError> {
        if !self.is_leader() {
            return Err(ApiError::leader_only("checkpoint"));
        }

        let mut inner = self.inner.write().await;
        let checkpointer = self.checkpointer.as_ref().ok_or(ApiError::NotConfigured)?;

        let current = self.current_version();
        if !inner.dirty {
            return Ok(CheckpointOutcome {
                version: current,
                new_checkpoint: false,
            });
        }

        let next = current.next();
        let dir = next.local_path(&self.local_dir);
        self.record_checkpoint(next, false, None);

        let engine = match self.save_and_upload(&inner, checkpointer, next, &dir).await {
            Ok(engine) => engine,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(version = %next, error = %message, "checkpoint failed");
                self.record_checkpoint(next, false, Some(message));
                if let Err(cleanup) = remove_dir_if_exists(&dir).await {
                    tracing::warn!(dir = %dir.display(), error = %cleanup, "failed to remove checkpoint directory");
                }
                return Err(ApiError::Checkpoint(e));
            }
        };

        let old_engine = std::mem::replace(&mut inner.engine, engine);
        if self
            .current_version
            .compare_exchange(current.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::error!(
                expected = %current,
                found = %self.current_version(),
                "version changed while the write lock was held"
            );
            std::process::abort();
        }
        inner.dirty = false;
        drop(inner);
        drop(old_engine);

        self.record_checkpoint(next, true, None);
        tracing::info!(version = %next, "published checkpoint");
        remove_in_background(current.local_path(&self.local_dir));

        Ok(CheckpointOutcome {
            version: next,
            new_checkpoint: true,
        })
    }

    async fn save_and_upload(
        &self,
        inner: &Inner,
        checkpointer: &Arc<dyn Checkpointer>,
        version: Version,
        dir: &Path,
    ) -> Result<Box<dyn Engine>> {
        remove_dir_if_exists(dir).await?;
        run_blocking(|| inner.engine.save(dir))
            .with_context(|| format!("Failed to save engine to {}", dir.display()))?;

        let engine = open_engine(self.loader.clone(), dir.to_path_buf())
            .await
            .context("Saved checkpoint does not open")?;
        let documents = inner.engine.sources()?;

        checkpointer.upload(version, dir, documents).await?;
        Ok(engine)
    }

    /// Switch to the newest complete checkpoint in the store, if it is newer
    /// than the live one.
    pub async fn adopt_latest_checkpoint(&self) -> Result<AdoptOutcome, ApiError> {
        if self.is_leader() {
            return Err(ApiError::Forbidden(
                "the leader publishes checkpoints and never adopts them".to_string(),
            ));
        }
        let checkpointer = self.checkpointer.as_ref().ok_or(ApiError::NotConfigured)?;

        let observed = self.current_version();
        let latest = checkpointer
            .list()
            .await
            .map_err(ApiError::Checkpoint)?
            .into_iter()
            .max()
            .unwrap_or_default();
        if latest <= observed {
            return Ok(AdoptOutcome {
                version: observed,
                adopted: false,
            });
        }

        let dir = latest.local_path(&self.local_dir);
        let engine = match self.fetch(checkpointer, latest, &dir).await {
            Ok(engine) => engine,
            Err(e) => {
                self.record_checkpoint(latest, false, Some(format!("{:#}", e)));
                if let Err(cleanup) = remove_dir_if_exists(&dir).await {
                    tracing::warn!(dir = %dir.display(), error = %cleanup, "failed to remove checkpoint directory");
                }
                return Err(ApiError::Checkpoint(e));
            }
        };

        let mut inner = self.inner.write().await;
        if self
            .current_version
            .compare_exchange(observed.0, latest.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            drop(inner);
            drop(engine);
            let now = self.current_version();
            tracing::info!(version = %latest, current = %now, "another adoption won; discarding download");
            if now != latest {
                remove_in_background(dir);
            }
            return Ok(AdoptOutcome {
                version: now,
                adopted: false,
            });
        }

        let old_engine = std::mem::replace(&mut inner.engine, engine);
        inner.dirty = false;
        drop(inner);
        drop(old_engine);

        self.record_checkpoint(latest, true, None);
        tracing::info!(from = %observed, to = %latest, "adopted checkpoint");
        remove_in_background(observed.local_path(&self.local_dir));

        Ok(AdoptOutcome {
            version: latest,
            adopted: true,
        })
    }

    async fn fetch(
        &self,
        checkpointer: &Arc<dyn Checkpointer>,
        version: Version,
        dir: &Path,
    ) -> Result<Box<dyn Engine>> {
        remove_dir_if_exists(dir).await?;
        checkpointer.download(version, dir).await?;
        open_engine(self.loader.clone(), dir.to_path_buf())
            .await
            .with_context(|| format!("Failed to open checkpoint {}", version))
    }
}

async fn open_engine(loader: Arc<dyn EngineLoader>, dir: PathBuf) -> Result<Box<dyn Engine>> {
    tokio::task::spawn_blocking(move || {
        loader
            .open(&dir)
            .with_context(|| format!("Failed to open engine at {}", dir.display()))
    })
    .await?
}

/// Run blocking work that borrows from the caller without stalling other
/// tasks on this worker. Current-thread runtimes have no other worker to hand
/// tasks to, so the work runs inline there.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

fn remove_in_background(dir: PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = remove_dir_if_exists(&dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove old checkpoint directory");
        }
    });
}
