//! Configuration management.
//!
//! [`CoreConfig`] gathers the options of every component. It is stored as
//! JSON at `<config_dir>/ytstream/config.json`; missing fields fall back to
//! their defaults so old files keep loading.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::byte_cache::ByteCacheConfig;
use crate::error::{CacheError, Error, Result};
use crate::fetch::DownloadConfig;
use crate::janitor::JanitorConfig;
use crate::prefetch::PrefetchConfig;
use crate::resolver::ResolverConfig;

/// Name of the metadata database inside the cache directory.
pub const METADATA_DB_FILE: &str = "metadata.db";

/// Complete core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root of the byte cache and metadata database.
    #[serde(default = "default_cache_directory")]
    pub cache_dir: PathBuf,
    /// Provider chain options.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Byte cache validity options.
    #[serde(default)]
    pub byte_cache: ByteCacheConfig,
    /// Eviction options.
    #[serde(default)]
    pub janitor: JanitorConfig,
    /// Prefetch options.
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    /// HTTP download options.
    #[serde(default)]
    pub download: DownloadConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_directory(),
            resolver: ResolverConfig::default(),
            byte_cache: ByteCacheConfig::default(),
            janitor: JanitorConfig::default(),
            prefetch: PrefetchConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Set the cache root.
    #[must_use]
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Replace the resolver options.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the byte cache options.
    #[must_use]
    pub fn with_byte_cache(mut self, byte_cache: ByteCacheConfig) -> Self {
        self.byte_cache = byte_cache;
        self
    }

    /// Replace the janitor options.
    #[must_use]
    pub fn with_janitor(mut self, janitor: JanitorConfig) -> Self {
        self.janitor = janitor;
        self
    }

    /// Replace the prefetch options.
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Replace the download options.
    #[must_use]
    pub fn with_download(mut self, download: DownloadConfig) -> Self {
        self.download = download;
        self
    }

    /// Clamp every section to its supported range.
    pub fn validate(&mut self) {
        self.resolver.validate();
        self.janitor.validate();
        self.prefetch.validate();
        self.download.validate();
    }

    /// Path of the metadata database.
    pub fn metadata_db_path(&self) -> PathBuf {
        self.cache_dir.join(METADATA_DB_FILE)
    }

    /// Load from `path`, writing defaults there if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.validate();

        info!("Loaded config from {}", path.display());
        debug!("Cache directory: {}", config.cache_dir.display());
        Ok(config)
    }

    /// Save to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| CacheError::WriteFailed {
                path: parent.to_path_buf(),
                reason: format!("Failed to create config directory: {e}"),
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| CacheError::WriteFailed {
            path: path.to_path_buf(),
            reason: format!("Failed to write config file: {e}"),
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }
}

/// Default cache root.
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("ytstream")
}

/// Default location of `config.json`.
pub fn default_config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("ytstream")
        .join("config.json")
}

/// Loads, caches, and persists the configuration.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    config: CoreConfig,
}

impl ConfigManager {
    /// Load from the default location.
    pub fn new() -> Result<Self> {
        Self::open(default_config_file_path())
    }

    /// Load from an explicit file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = CoreConfig::load_from(&path)?;
        Ok(Self { path, config })
    }

    /// Current configuration.
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// File backing this manager.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, replace, and persist the configuration.
    pub fn update(&mut self, mut config: CoreConfig) -> Result<()> {
        config.validate();
        self.config = config;
        self.config.save_to(&self.path)
    }

    /// Restore and persist the defaults.
    pub fn reset(&mut self) -> Result<()> {
        self.config = CoreConfig::default();
        self.config.save_to(&self.path)
    }
}
