//! # ndb-server CLI
//!
//! ## Usage
//!
//! ```bash
//! ndb-server --config ./config/ndb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ndb-server serve` | Run the HTTP server and its replication loop |
//! | `ndb-server checkpoints list` | List complete checkpoints in the configured store |
//!
//! ## Examples
//!
//! ```bash
//! # Leader publishing to S3 every 10 minutes
//! ndb-server serve --leader --s3-bucket ndb-checkpoints --s3-region us-west-2 \
//!     --checkpoint-interval 600
//!
//! # Follower on port 8080 reading from a shared directory
//! ndb-server serve --port 8080 --store-dir /mnt/shared/ndb-store
//!
//! # Inspect the store
//! ndb-server checkpoints list --config ./config/ndb.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ndb_core::LexicalEngineLoader;
use ndb_server::checkpoint::{Checkpointer, StoreCheckpointer};
use ndb_server::config::{self, Config, LocalStoreConfig, S3StoreConfig};
use ndb_server::replication;
use ndb_server::server;
use ndb_server::state::{Role, ServerState};
use ndb_server::object_store;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "./config/ndb.toml";

/// ndb-server: a retrieval engine behind HTTP, replicated through
/// checkpoints in an object store.
#[derive(Parser)]
#[command(name = "ndb-server", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ndb.toml`; if that file does not exist the
    /// built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    ///
    /// A leader accepts writes and publishes checkpoints periodically; a
    /// follower serves queries and adopts new checkpoints as they appear.
    Serve(ServeArgs),

    /// Inspect the checkpoint store.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointsAction,
    },
}

#[derive(Subcommand)]
enum CheckpointsAction {
    /// List complete checkpoints, oldest first.
    List,
}

#[derive(Args)]
struct ServeArgs {
    /// Run as the leader.
    #[arg(long)]
    leader: bool,

    /// Port to listen on (keeps the host of the configured bind address).
    #[arg(long)]
    port: Option<u16>,

    /// Full bind address, e.g. `127.0.0.1:8080`. Takes precedence over `--port`.
    #[arg(long)]
    bind: Option<String>,

    /// S3 bucket holding checkpoints.
    #[arg(long)]
    s3_bucket: Option<String>,

    #[arg(long)]
    s3_region: Option<String>,

    /// Custom S3 endpoint (MinIO, LocalStack).
    #[arg(long)]
    s3_endpoint: Option<String>,

    /// Use a directory as the checkpoint store instead of S3.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Number of complete checkpoints to retain in the store.
    #[arg(long)]
    max_checkpoints: Option<usize>,

    /// Local directory for the active engine files.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Seconds between checkpoints (leader) or polls (follower).
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    #[arg(long)]
    tls_cert: Option<PathBuf>,

    #[arg(long)]
    tls_key: Option<PathBuf>,
}

impl ServeArgs {
    fn apply(self, cfg: &mut Config) -> anyhow::Result<()> {
        if self.s3_bucket.is_some() && self.store_dir.is_some() {
            bail!("--s3-bucket and --store-dir are mutually exclusive");
        }
        if self.leader {
            cfg.server.leader = true;
        }
        if let Some(port) = self.port {
            cfg.server.set_port(port);
        }
        if let Some(bind) = self.bind {
            cfg.server.bind = bind;
        }

        let cp = &mut cfg.checkpoint;
        if let Some(bucket) = self.s3_bucket {
            match cp.s3.as_mut() {
                Some(s3) => s3.bucket = bucket,
                None => {
                    cp.s3 = Some(S3StoreConfig {
                        bucket,
                        region: "us-east-1".to_string(),
                        endpoint_url: None,
                    })
                }
            }
            cp.local = None;
        }
        if self.s3_region.is_some() || self.s3_endpoint.is_some() {
            let Some(s3) = cp.s3.as_mut() else {
                bail!("--s3-region and --s3-endpoint require an S3 bucket (--s3-bucket or [checkpoint.s3])");
            };
            if let Some(region) = self.s3_region {
                s3.region = region;
            }
            if let Some(endpoint) = self.s3_endpoint {
                s3.endpoint_url = Some(endpoint);
            }
        }
        if let Some(root) = self.store_dir {
            cp.s3 = None;
            cp.local = Some(LocalStoreConfig { root });
        }
        if let Some(n) = self.max_checkpoints {
            cp.max_checkpoints = n;
        }
        if let Some(dir) = self.checkpoint_dir {
            cp.local_dir = dir;
        }
        if let Some(secs) = self.checkpoint_interval {
            cp.interval_secs = secs;
        }

        if let Some(cert) = self.tls_cert {
            cfg.server.tls_cert = Some(cert);
        }
        if let Some(key) = self.tls_key {
            cfg.server.tls_key = Some(key);
        }
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn load(cli_config: Option<PathBuf>) -> anyhow::Result<Config> {
    let explicit = cli_config.is_some();
    let path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    config::load_config_or_default(&path, explicit)
}

async fn serve(mut cfg: Config, args: ServeArgs) -> anyhow::Result<()> {
    args.apply(&mut cfg)?;
    cfg.validate()?;

    let role = if cfg.server.leader {
        Role::Leader
    } else {
        Role::Follower
    };

    let checkpointer: Option<Arc<dyn Checkpointer>> = object_store::from_config(&cfg.checkpoint)?
        .map(|store| {
            tracing::info!(store = %store.location(), "checkpoint store configured");
            Arc::new(StoreCheckpointer::from_config(store, &cfg.checkpoint)) as Arc<dyn Checkpointer>
        });
    if checkpointer.is_none() {
        tracing::warn!("no checkpoint store configured, checkpointing is disabled");
    }

    let state = Arc::new(
        ServerState::new(
            role,
            checkpointer,
            Arc::new(LexicalEngineLoader),
            cfg.checkpoint.local_dir.clone(),
        )
        .await
        .context("Failed to initialize server state")?,
    );

    let interval = cfg.checkpoint.interval();
    let replication = async {
        match state.role() {
            Role::Leader if state.has_checkpointer() => replication::run_leader_loop(state.clone(), interval).await,
            Role::Leader => std::future::pending::<anyhow::Result<()>>().await,
            Role::Follower => replication::run_follower_loop(state.clone(), interval).await,
        }
    };

    tokio::select! {
        result = server::run_server(&cfg.server, state.clone()) => result,
        result = replication => {
            result.context("replication loop stopped")?;
            Ok(())
        }
    }
}

async fn list_checkpoints(cfg: Config) -> anyhow::Result<()> {
    let Some(store) = object_store::from_config(&cfg.checkpoint)? else {
        bail!("no checkpoint store configured: set [checkpoint.s3] or [checkpoint.local]");
    };
    let location = store.location();
    let checkpointer = StoreCheckpointer::from_config(store, &cfg.checkpoint);

    let versions = checkpointer.list().await?;
    if versions.is_empty() {
        println!("No checkpoints in {}", location);
        return Ok(());
    }

    println!("{:<12} {:<26} DOCUMENTS", "VERSION", "TIMESTAMP");
    for version in versions {
        let meta = checkpointer.metadata(version).await?;
        println!(
            "{:<12} {:<26} {}",
            version.name(),
            meta.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            meta.documents.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = load(cli.config)?;

    match cli.command {
        Commands::Serve(args) => serve(cfg, args).await,
        Commands::Checkpoints {
            action: CheckpointsAction::List,
        } => list_checkpoints(cfg).await,
    }
}
