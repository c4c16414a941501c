//! Node configuration
//!
//! Stored as TOML at `~/.tpi/node.toml`. Every field can be overridden from
//! the command line; the merged result is validated before use.

use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `~/.tpi`, or `./.tpi` when there is no home directory
pub fn node_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tpi")
}

/// Settings for one rank of a tensor-parallel deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This process's rank; 0 is the master
    pub rank: usize,

    pub world_size: usize,

    /// Master host, used for rendezvous and shard sync
    pub master_addr: String,

    /// Collective rendezvous port on the master
    pub master_port: u16,

    /// Shard file server port on the master
    pub file_port: u16,

    /// Full model: `manifest.json` + `weights.bin` (master only)
    pub model_dir: PathBuf,

    /// Per-rank shard root; defaults to `<model_dir>/split`
    pub split_dir: Option<PathBuf>,

    /// Layers resident at once (at least 2)
    pub window_size: usize,

    /// Re-download every shard even when checksums match
    pub force_download: bool,

    /// Master re-splits even if shards exist
    pub resplit: bool,

    /// Tokens to generate; negative means the model's limit
    pub length: i64,

    pub seed: u64,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,

    pub collective_timeout_ms: u64,

    pub fetch_retries: u32,
    pub fetch_timeout_ms: u64,

    /// Defensive ceiling on resident layer bytes
    pub memory_budget_bytes: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            file_port: 29501,
            model_dir: PathBuf::from("model"),
            split_dir: None,
            window_size: 2,
            force_download: false,
            resplit: false,
            length: 32,
            seed: 0,
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            collective_timeout_ms: 30_000,
            fetch_retries: 3,
            fetch_timeout_ms: 10_000,
            memory_budget_bytes: None,
        }
    }
}

impl NodeConfig {
    /// Default configuration file path: `~/.tpi/node.toml`
    pub fn default_path() -> PathBuf {
        node_home().join("node.toml")
    }

    /// Save configuration to file (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(path = %temp_path.display(), error = %e, "Failed to write temp config file");
            e
        })?;
        fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "Node configuration saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), rank = config.rank, "Node configuration loaded");
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(NodeError::Config("world_size must be at least 1".to_string()));
        }
        if self.rank >= self.world_size {
            return Err(NodeError::Config(format!(
                "rank {} is outside world_size {}",
                self.rank, self.world_size
            )));
        }
        if self.window_size < 2 {
            return Err(NodeError::Config(format!(
                "window_size must be at least 2, got {}",
                self.window_size
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(NodeError::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.temperature >= 0.0) {
            return Err(NodeError::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if self.collective_timeout_ms == 0 || self.fetch_timeout_ms == 0 {
            return Err(NodeError::Config("timeouts must be positive".to_string()));
        }
        if self.master_addr.is_empty() {
            return Err(NodeError::Config("master_addr is empty".to_string()));
        }
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn split_dir(&self) -> PathBuf {
        self.split_dir
            .clone()
            .unwrap_or_else(|| self.model_dir.join("split"))
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// `master_addr:file_port`
    pub fn file_server_addr(&self) -> String {
        format!("{}:{}", self.master_addr, self.file_port)
    }
}
