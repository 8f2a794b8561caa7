//! Configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{VfsError, VfsResult};

/// Name of the scratch directory under the system temp dir
pub const TEMP_DIR_NAME: &str = "archive-browser";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Reader handle cache sizing
    pub cache: CacheConfig,
    /// Size limits for reads
    pub limits: LimitsConfig,
    /// Archive type handling
    pub formats: FormatsConfig,
    /// Nested archive materialization
    pub nested: NestedConfig,
}

/// Two-tier handle cache capacities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries that were checked out more than once
    pub protected_capacity: usize,
    /// Entries that were checked out once
    pub probationary_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            protected_capacity: 20,
            probationary_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Entries larger than this are refused by whole-buffer reads
    pub too_large_threshold: u64,
    /// Size of one chunk handed from a background extractor to a reader
    pub stream_chunk_size: usize,
    /// Number of chunks buffered between extractor and reader
    pub stream_queue_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            too_large_threshold: 20 * 1024 * 1024,
            stream_chunk_size: 32 * 1024,
            stream_queue_depth: 8,
        }
    }
}

impl LimitsConfig {
    pub fn is_too_large(&self, length: u64) -> bool {
        length > self.too_large_threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormatsConfig {
    /// Browse .tar.gz/.tgz (and bz2/xz variants) directly as tar trees.
    /// When false they show a single .tar member which opens as a nested archive.
    pub expand_compressed_tar: bool,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            expand_compressed_tar: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct NestedConfig {
    /// Scratch root for extracted nested archives (defaults to the system temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_root: Option<PathBuf>,
}

impl NestedConfig {
    /// Resolved scratch root
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(TEMP_DIR_NAME))
    }
}

impl Config {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(content: &str) -> VfsResult<Self> {
        toml_edit::de::from_str(content)
            .map_err(|e| VfsError::Config(e.to_string()))
    }

    /// Load configuration from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> VfsResult<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("config {} not found, using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_toml_string(&self) -> VfsResult<String> {
        toml_edit::ser::to_string_pretty(self)
            .map_err(|e| VfsError::Config(e.to_string()))
    }
}
