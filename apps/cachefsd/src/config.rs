//! Daemon configuration.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/cachefs/cachefsd.toml`. A missing file is created with
//! defaults on first start.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use cachefs_protocol::{CacheLayout, ConnectRequest};
use cachefs_remote::S3Config;
use cachefs_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_WORKER_SLOTS, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

/// File name of the transfer database inside the cache root.
const DATABASE_FILE: &str = ".cachefs.db";

#[derive(Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bucket served by this daemon.
    #[serde(default)]
    pub bucket: String,

    /// Remote store URL. Empty means the provider's default endpoint.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Root of the shared cache tree.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Transfer database. Defaults to `<cache_dir>/.cachefs.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,

    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,

    /// Preferred multipart chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_adapter_socket")]
    pub adapter_socket: PathBuf,

    #[serde(default = "default_broker_socket")]
    pub broker_socket: PathBuf,

    /// Identity the scheduler switches to after starting the broker.
    /// Only honoured when started as root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_gid: Option<u32>,
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/cachefs")
}

fn default_worker_slots() -> usize {
    DEFAULT_WORKER_SLOTS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_adapter_socket() -> PathBuf {
    PathBuf::from("/run/cachefs/adapter.sock")
}

fn default_broker_socket() -> PathBuf {
    PathBuf::from("/run/cachefs/broker.sock")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            region: default_region(),
            access_key: String::new(),
            secret_key: String::new(),
            cache_dir: default_cache_dir(),
            database: None,
            worker_slots: default_worker_slots(),
            chunk_size: default_chunk_size(),
            adapter_socket: default_adapter_socket(),
            broker_socket: default_broker_socket(),
            run_as_uid: None,
            run_as_gid: None,
        }
    }
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("cache_dir", &self.cache_dir)
            .field("worker_slots", &self.worker_slots)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl DaemonConfig {
    /// Loads configuration from `path`, or from the default location.
    /// A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: DaemonConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = DaemonConfig::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "default configuration written");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Holds the remote secret.
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket.is_empty() {
            bail!("no bucket configured");
        }
        if self.bucket.contains(':') {
            bail!("bucket name {:?} may not contain ':'", self.bucket);
        }
        if self.worker_slots == 0 {
            bail!("worker_slots must be at least 1");
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            bail!(
                "chunk_size {} is below the remote minimum part size of {MIN_CHUNK_SIZE}",
                self.chunk_size
            );
        }
        if self.run_as_uid.is_some() != self.run_as_gid.is_some() {
            bail!("run_as_uid and run_as_gid must be set together");
        }
        Ok(())
    }

    pub fn layout(&self) -> CacheLayout {
        CacheLayout::new(&self.cache_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.cache_dir.join(DATABASE_FILE))
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            endpoint: (!self.endpoint.is_empty()).then(|| self.endpoint.clone()),
            region: self.region.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }

    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            bucket: self.bucket.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

/// Default configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    Ok(PathBuf::from(home)
        .join(".config")
        .join("cachefs")
        .join("cachefsd.toml"))
}
