//! Background replication loops.
//!
//! Exactly one loop runs per process, beside the HTTP server:
//!
//! - the leader periodically drains the dirty flag into a new checkpoint;
//! - a follower periodically adopts the newest checkpoint in the store.
//!
//! A leader that fails to publish [`MAX_CONSECUTIVE_FAILURES`] times in a
//! row gives up and returns an error, which takes the process down so that
//! an orchestrator can restart it. Follower failures are logged and retried
//! on the next tick indefinitely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::MissedTickBehavior;

use crate::state::ServerState;

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Publish a checkpoint every `period`. Returns only on persistent failure.
pub async fn run_leader_loop(state: Arc<ServerState>, period: Duration) -> Result<()> {
    let mut interval = ticker(period);
    // The first tick completes immediately; skip it so startup does not publish.
    interval.tick().await;

    tracing::info!(interval_secs = period.as_secs(), "leader checkpoint loop started");

    let mut failures = 0u32;
    loop {
        interval.tick().await;
        match state.publish_checkpoint().await {
            Ok(outcome) => {
                failures = 0;
                if outcome.new_checkpoint {
                    tracing::info!(version = %outcome.version, "periodic checkpoint published");
                } else {
                    tracing::debug!(version = %outcome.version, "no changes since last checkpoint");
                }
            }
            Err(e) => {
                failures += 1;
                tracing::error!(error = %e, failures, "periodic checkpoint failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    bail!(
                        "checkpointing failed {} times in a row, last error: {}",
                        failures,
                        e
                    );
                }
            }
        }
    }
}

/// Adopt the newest checkpoint every `period`. Never returns.
pub async fn run_follower_loop(state: Arc<ServerState>, period: Duration) -> Result<()> {
    let mut interval = ticker(period);
    interval.tick().await;

    tracing::info!(interval_secs = period.as_secs(), "follower update loop started");

    loop {
        interval.tick().await;
        match state.adopt_latest_checkpoint().await {
            Ok(outcome) if outcome.adopted => {
                tracing::info!(version = %outcome.version, "follower updated");
            }
            Ok(outcome) => {
                tracing::debug!(version = %outcome.version, "follower up to date");
            }
            Err(e) => {
                tracing::error!(error = %e, "follower update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpointer, Version};
    use crate::state::Role;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use ndb_core::{LexicalEngineLoader, Source};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// A store that is always down.
    #[derive(Default)]
    struct Unreachable {
        lists: AtomicUsize,
        uploads: AtomicUsize,
        healthy_lists: usize,
    }

    #[async_trait]
    impl Checkpointer for Unreachable {
        async fn list(&self) -> Result<Vec<Version>> {
            let n = self.lists.fetch_add(1, Ordering::SeqCst);
            if n < self.healthy_lists {
                return Ok(vec![]);
            }
            Err(anyhow!("connection refused"))
        }

        async fn download(&self, _: Version, _: &Path) -> Result<()> {
            Err(anyhow!("connection refused"))
        }

        async fn upload(&self, _: Version, _: &Path, _: Vec<Source>) -> Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_leader_loop_gives_up_after_three_failures() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Unreachable {
            healthy_lists: 1,
            ..Default::default()
        });
        let state = Arc::new(
            ServerState::new(
                Role::Leader,
                Some(store.clone() as Arc<dyn Checkpointer>),
                Arc::new(LexicalEngineLoader),
                tmp.path().to_path_buf(),
            )
            .await
            .unwrap(),
        );

        {
            let mut guard = state.write("insert").await.unwrap();
            guard
                .engine()
                .insert(vec!["alpha".to_string()], vec![], "a.csv", "A", None)
                .unwrap();
            guard.mark_dirty();
        }

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_leader_loop(state.clone(), Duration::from_millis(10)),
        )
        .await
        .expect("leader loop should stop on its own");

        assert!(result.is_err());
        assert_eq!(store.uploads.load(Ordering::SeqCst), 3);
        assert_eq!(state.current_version(), Version(0));
        assert!(state.is_dirty().await);
        assert!(!tmp.path().join("ndb_1").exists());
    }

    #[tokio::test]
    async fn test_follower_loop_survives_errors() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Unreachable {
            healthy_lists: 1,
            ..Default::default()
        });
        let state = Arc::new(
            ServerState::new(
                Role::Follower,
                Some(store.clone() as Arc<dyn Checkpointer>),
                Arc::new(LexicalEngineLoader),
                tmp.path().to_path_buf(),
            )
            .await
            .unwrap(),
        );

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            run_follower_loop(state.clone(), Duration::from_millis(10)),
        )
        .await;

        assert!(result.is_err(), "follower loop must keep running");
        assert!(store.lists.load(Ordering::SeqCst) >= 4);
        assert_eq!(state.current_version(), Version(0));
    }
}
