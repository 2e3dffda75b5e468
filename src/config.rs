//! Configuration module for the vector storage core.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CV_` and use double underscores
//! to separate nested levels:
//! - `CV_VECTOR__MMAP_CACHE_THRESHOLD=5000` sets `vector.mmap_cache_threshold`
//! - `CV_SYNC__DESYNC_RATIO=0.2` sets `sync.desync_ratio`
//! - `CV_VECTOR__PREFER_GPU=true` sets `vector.prefer_gpu`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Path to the per-project storage directory
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Vector index settings
    #[serde(default)]
    pub vector: VectorConfig,

    /// Lexical/dense drift detection
    #[serde(default)]
    pub sync: SyncConfig,

    /// Metadata store and symbol cache settings
    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorConfig {
    /// Vector count at or above which the binary vector cache is written
    #[serde(default = "default_mmap_cache_threshold")]
    pub mmap_cache_threshold: usize,

    /// Vector count at or above which the partitioned (IVF) index is used
    #[serde(default = "default_ivf_threshold")]
    pub ivf_threshold: usize,

    /// IVF partition count; 0 derives it from the vector count
    #[serde(default)]
    pub ivf_nlist: usize,

    /// Number of IVF partitions scanned per query
    #[serde(default = "default_ivf_nprobe")]
    pub ivf_nprobe: usize,

    /// Try to keep the index GPU-resident when a device is available
    #[serde(default = "default_false")]
    pub prefer_gpu: bool,

    /// Upper bound for index vector memory, checked before growth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Enable lexical/dense drift detection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Relative count difference that triggers a resync
    #[serde(default = "default_desync_ratio")]
    pub desync_ratio: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetadataConfig {
    /// Number of symbol cache buckets (rounded up to a power of two)
    #[serde(default = "default_symbol_cache_buckets")]
    pub symbol_cache_buckets: usize,

    /// Write the index file before every metadata commit
    #[serde(default = "default_true")]
    pub persist_on_commit: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// One of: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_index_path() -> PathBuf {
    PathBuf::from(".codevec/index")
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_mmap_cache_threshold() -> usize {
    10_000
}
fn default_ivf_threshold() -> usize {
    50_000
}
fn default_ivf_nprobe() -> usize {
    8
}
fn default_desync_ratio() -> f64 {
    0.10
}
fn default_symbol_cache_buckets() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_path: default_index_path(),
            debug: false,
            vector: VectorConfig::default(),
            sync: SyncConfig::default(),
            metadata: MetadataConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            mmap_cache_threshold: default_mmap_cache_threshold(),
            ivf_threshold: default_ivf_threshold(),
            ivf_nlist: 0,
            ivf_nprobe: default_ivf_nprobe(),
            prefer_gpu: false,
            memory_limit_mb: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            desync_ratio: default_desync_ratio(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            symbol_cache_buckets: default_symbol_cache_buckets(),
            persist_on_commit: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(".codevec/settings.toml"));
        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref().to_path_buf())
            .extract()
            .map_err(Box::new)
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(config_path))
            // Double underscore separates nested levels
            .merge(Env::prefixed("CV_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find the workspace config by looking for a .codevec directory
    /// from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(".codevec");
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Bucket count actually used by the symbol cache.
    pub fn symbol_cache_buckets(&self) -> usize {
        self.metadata.symbol_cache_buckets.max(1).next_power_of_two()
    }

    /// Memory cap for index vectors in bytes, if configured.
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        self.vector.memory_limit_bytes()
    }
}

impl VectorConfig {
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        self.memory_limit_mb
            .map(|mb| usize::try_from(mb).unwrap_or(usize::MAX).saturating_mul(1024 * 1024))
    }
}
