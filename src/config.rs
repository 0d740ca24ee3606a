//! Server configuration
//!
//! A [`ServerConfig`] can come from defaults, a JSON file, command-line
//! flags, or a mix: flags always win over the file.

use crate::error::{Result, VaultError};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// BlobVault server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base path of the key pair: `<key_file>.pub` and `<key_file>.pri`
    pub key_file: PathBuf,
    /// Persistence log
    pub data_file: PathBuf,
    pub key_bits: usize,
    pub shards: usize,
    pub workers: usize,
    pub quota_interval_secs: f64,
    pub upload_quota: u64,
    pub download_quota: u64,
    pub request_quota: u64,
    pub mru_capacity: usize,
    pub max_value_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9999".to_string(),
            key_file: PathBuf::from("rsa"),
            data_file: PathBuf::from("company.dir"),
            key_bits: 2048,
            shards: 1024,
            workers: 4,
            quota_interval_secs: 60.0,
            upload_quota: 1 << 20,
            download_quota: 1 << 20,
            request_quota: 1024,
            mru_capacity: 1024,
            max_value_size: 1 << 20,
        }
    }
}

impl ServerConfig {
    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(VaultError::Config("shards must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(VaultError::Config("workers must be at least 1".to_string()));
        }
        if self.mru_capacity == 0 {
            return Err(VaultError::Config(
                "mru_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.quota_interval_secs.is_finite() && self.quota_interval_secs > 0.0) {
            return Err(VaultError::Config(format!(
                "quota_interval_secs must be positive, got {}",
                self.quota_interval_secs
            )));
        }
        Ok(())
    }

    pub fn quota_interval(&self) -> Duration {
        Duration::from_secs_f64(self.quota_interval_secs)
    }

    /// Largest frame a connection will accept before hanging up
    pub fn frame_limit(&self) -> usize {
        self.max_value_size.saturating_mul(2).saturating_add(64 * 1024)
    }

    pub fn public_key_path(&self) -> PathBuf {
        with_suffix(&self.key_file, "pub")
    }

    pub fn private_key_path(&self) -> PathBuf {
        with_suffix(&self.key_file, "pri")
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Command-line flags for the server binary
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Authenticated key/value storage server", long_about = None)]
pub struct ServerArgs {
    /// JSON file providing the base configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:9999
    #[arg(long)]
    pub bind: Option<String>,

    /// Base name of the RSA key files (<name>.pub / <name>.pri)
    #[arg(short = 'k', long)]
    pub key_file: Option<PathBuf>,

    /// Persistence log file
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// RSA modulus size used when generating a new key pair
    #[arg(long)]
    pub key_bits: Option<usize>,

    /// Number of independently locked store shards
    #[arg(short = 'b', long)]
    pub shards: Option<usize>,

    /// Number of worker threads serving connections
    #[arg(short = 't', long)]
    pub workers: Option<usize>,

    /// Seconds after which a user's quota counters reset
    #[arg(short = 'i', long = "quota-interval")]
    pub quota_interval: Option<f64>,

    /// Bytes a user may upload per quota interval
    #[arg(short = 'u', long)]
    pub upload_quota: Option<u64>,

    /// Bytes a user may download per quota interval
    #[arg(short = 'd', long)]
    pub download_quota: Option<u64>,

    /// Requests a user may issue per quota interval
    #[arg(short = 'r', long)]
    pub request_quota: Option<u64>,

    /// Number of keys tracked by the most-recently-used index
    #[arg(long)]
    pub mru_capacity: Option<usize>,

    /// Largest value (in bytes) accepted by insert, upsert and set-content
    #[arg(long)]
    pub max_value_size: Option<usize>,
}

impl ServerArgs {
    /// Resolve the flags into a validated config
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(key_file) = self.key_file {
            config.key_file = key_file;
        }
        if let Some(data_file) = self.data_file {
            config.data_file = data_file;
        }
        if let Some(bits) = self.key_bits {
            config.key_bits = bits;
        }
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(interval) = self.quota_interval {
            config.quota_interval_secs = interval;
        }
        if let Some(up) = self.upload_quota {
            config.upload_quota = up;
        }
        if let Some(down) = self.download_quota {
            config.download_quota = down;
        }
        if let Some(req) = self.request_quota {
            config.request_quota = req;
        }
        if let Some(capacity) = self.mru_capacity {
            config.mru_capacity = capacity;
        }
        if let Some(max) = self.max_value_size {
            config.max_value_size = max;
        }

        config.validate()?;
        Ok(config)
    }
}
