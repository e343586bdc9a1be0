//! Configuration loading and validation.
//!
//! The server reads a single TOML file (default `./config/ndb.toml`). Every
//! section and field is optional; a missing file at the default path yields
//! the built-in defaults, which describe a standalone leader with no
//! checkpoint store.
//!
//! ```toml
//! [server]
//! leader = true
//! bind = "0.0.0.0:80"
//!
//! [checkpoint]
//! local_dir = "./checkpoints"
//! interval_secs = 3600
//! max_checkpoints = 3
//!
//! [checkpoint.s3]
//! bucket = "ndb-checkpoints"
//! region = "us-west-2"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! Command-line flags are applied on top of the file by `main` and the
//! result is checked with [`Config::validate`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Whether this node accepts writes and publishes checkpoints.
    #[serde(default)]
    pub leader: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            leader: false,
            bind: default_bind(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:80".to_string()
}

impl ServerConfig {
    /// Replace the port of `bind`, keeping its host.
    pub fn set_port(&mut self, port: u16) {
        let host = match self.bind.rsplit_once(':') {
            Some((host, _)) => host,
            None => self.bind.as_str(),
        };
        self.bind = format!("{}:{}", host, port);
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    /// Root under which `ndb_<version>` directories are kept.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default)]
    pub s3: Option<S3StoreConfig>,
    #[serde(default)]
    pub local: Option<LocalStoreConfig>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            interval_secs: default_interval_secs(),
            max_checkpoints: default_max_checkpoints(),
            list_timeout_secs: default_list_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            s3: None,
            local: None,
        }
    }
}

fn default_local_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_max_checkpoints() -> usize {
    3
}
fn default_list_timeout_secs() -> u64 {
    120
}
fn default_transfer_timeout_secs() -> u64 {
    600
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// True when either object store backend is configured.
    pub fn store_configured(&self) -> bool {
        self.s3.is_some() || self.local.is_some()
    }
}

/// S3 (or S3-compatible) bucket holding the `checkpoints/` prefix.
#[derive(Debug, Deserialize, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for MinIO or LocalStack, e.g. `http://localhost:9000`.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// A shared directory used in place of a bucket.
#[derive(Debug, Deserialize, Clone)]
pub struct LocalStoreConfig {
    pub root: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let cp = &self.checkpoint;

        if cp.interval_secs == 0 {
            bail!("checkpoint.interval_secs must be > 0");
        }
        if cp.max_checkpoints < 1 {
            bail!("checkpoint.max_checkpoints must be >= 1");
        }
        if cp.list_timeout_secs == 0 || cp.transfer_timeout_secs == 0 {
            bail!("checkpoint timeouts must be > 0");
        }

        if cp.s3.is_some() && cp.local.is_some() {
            bail!("checkpoint.s3 and checkpoint.local are mutually exclusive");
        }
        if let Some(s3) = &cp.s3 {
            if s3.bucket.trim().is_empty() {
                bail!("checkpoint.s3.bucket must not be empty");
            }
            if s3.region.trim().is_empty() {
                bail!("checkpoint.s3.region must not be empty");
            }
        }

        if !self.server.leader && !cp.store_configured() {
            bail!(
                "a follower needs a checkpoint store: configure [checkpoint.s3] or [checkpoint.local]"
            );
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            bail!("server.tls_cert and server.tls_key must be set together");
        }

        Ok(())
    }
}

/// Read and parse a config file. Validation is left to the caller so that
/// command-line overrides can be applied first.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults unless the
/// path was given explicitly.
pub fn load_config_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse("");
        assert!(!cfg.server.leader);
        assert_eq!(cfg.server.bind, "0.0.0.0:80");
        assert_eq!(cfg.checkpoint.interval_secs, 3600);
        assert_eq!(cfg.checkpoint.max_checkpoints, 3);
        assert_eq!(cfg.checkpoint.list_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.checkpoint.transfer_timeout(), Duration::from_secs(600));
        assert!(!cfg.checkpoint.store_configured());
    }

    #[test]
    fn test_full_file() {
        let cfg = parse(
            r#"
            [server]
            leader = true
            bind = "127.0.0.1:8080"

            [checkpoint]
            local_dir = "/var/lib/ndb"
            interval_secs = 60
            max_checkpoints = 5

            [checkpoint.s3]
            bucket = "ndb"
            region = "us-west-2"
            endpoint_url = "http://localhost:9000"
            "#,
        );
        cfg.validate().unwrap();
        assert!(cfg.server.leader);
        assert_eq!(cfg.checkpoint.local_dir, PathBuf::from("/var/lib/ndb"));
        let s3 = cfg.checkpoint.s3.unwrap();
        assert_eq!(s3.endpoint_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_validation_errors() {
        let follower_without_store = parse("");
        assert!(follower_without_store.validate().is_err());

        let both_stores = parse(
            r#"
            [server]
            leader = true
            [checkpoint.s3]
            bucket = "b"
            [checkpoint.local]
            root = "/tmp/x"
            "#,
        );
        assert!(both_stores.validate().is_err());

        let zero_retention = parse(
            r#"
            [server]
            leader = true
            [checkpoint]
            max_checkpoints = 0
            "#,
        );
        assert!(zero_retention.validate().is_err());

        let half_tls = parse(
            r#"
            [server]
            leader = true
            tls_cert = "/etc/cert.pem"
            "#,
        );
        assert!(half_tls.validate().is_err());

        let standalone_leader = parse("[server]\nleader = true\n");
        standalone_leader.validate().unwrap();
    }

    #[test]
    fn test_set_port_keeps_host() {
        let mut server = ServerConfig::default();
        server.set_port(8080);
        assert_eq!(server.bind, "0.0.0.0:8080");

        server.bind = "[::1]:80".to_string();
        server.set_port(9000);
        assert_eq!(server.bind, "[::1]:9000");
    }

    #[test]
    fn test_missing_default_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ndb.toml");
        let cfg = load_config_or_default(&path, false).unwrap();
        assert_eq!(cfg.checkpoint.max_checkpoints, 3);
        assert!(load_config_or_default(&path, true).is_err());
    }
}
