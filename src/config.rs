use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::offline::{SqliteStorage, SyncPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long GET responses stay readable offline
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Upper bound on cached entries kept by the sweep
  #[serde(default = "default_max_entries")]
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      max_entries: default_max_entries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Failed replays before an action is dead-lettered (unset = retry forever)
  pub max_attempts: Option<u32>,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Path probed for connectivity, relative to the base URL
  #[serde(default)]
  pub probe_path: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: None,
      probe_interval_secs: default_probe_interval_secs(),
      probe_path: String::new(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Offline database location (default: $XDG_DATA_HOME/prepdash/offline.db)
  pub path: Option<PathBuf>,
}

fn default_base_url() -> String {
  "http://localhost:5000/api".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_max_entries() -> usize {
  1000
}

fn default_probe_interval_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./prepdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/prepdash/config.yaml
  ///
  /// Defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("prepdash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("prepdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var("PREPDASH_TOKEN").ok().filter(|t| !t.is_empty())
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn cache_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.ttl_secs as i64)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs)
  }

  pub fn sync_policy(&self) -> SyncPolicy {
    SyncPolicy {
      max_attempts: self.sync.max_attempts,
      max_entries: self.cache.max_entries,
    }
  }
}
