//! Gateway configuration and the atomically-swapped runtime snapshot.
//!
//! The external source is a JSON object with `privateKey`, `whitelist` and
//! `maxConcurrentRequestsPerIP`. A reload parses the whole source into a
//! fresh [`Config`] and publishes it in one step; readers always see either
//! the previous snapshot or the new one, never a mix. Any load failure
//! (missing file, bad JSON, invalid key, zero limit) installs the built-in
//! defaults rather than keeping the previous snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{DecryptError, Decryptor};

/// Per-client concurrency ceiling used when the source does not set one, and
/// after a failed reload.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// On-disk shape of the configuration source.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(rename = "privateKey", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(
        rename = "maxConcurrentRequestsPerIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrent_requests_per_ip: Option<usize>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Validated runtime snapshot. Immutable once published.
#[derive(Debug, Clone)]
pub struct Config {
    pub decryptor: Option<Decryptor>,
    pub whitelist: Vec<String>,
    pub max_concurrent_per_client: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            decryptor: None,
            whitelist: Vec::new(),
            max_concurrent_per_client: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl TryFrom<ConfigFile> for Config {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, ConfigError> {
        let max_concurrent_per_client = file
            .max_concurrent_requests_per_ip
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        if max_concurrent_per_client == 0 {
            return Err(ConfigError::InvalidLimit);
        }

        let decryptor = match file.private_key.as_deref().map(str::trim) {
            Some(material) if !material.is_empty() => Some(Decryptor::from_key_material(material)?),
            _ => None,
        };

        Ok(Self {
            decryptor,
            whitelist: file.whitelist,
            max_concurrent_per_client,
        })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config source: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("maxConcurrentRequestsPerIP must be a positive integer")]
    InvalidLimit,

    #[error("invalid private key: {0}")]
    Key(#[from] DecryptError),

    #[error("no config source configured")]
    NoSource,
}

/// Process-wide configuration state.
///
/// `current()` is a lock-free snapshot read; `reload()` replaces the
/// snapshot wholesale and is safe to invoke concurrently with in-flight
/// requests.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: ArcSwap<Config>,
}

impl ConfigStore {
    /// Create a store backed by a config file and load it immediately.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: Some(path.into()),
            current: ArcSwap::from_pointee(Config::default()),
        };
        store.reload();
        store
    }

    /// Store with a fixed snapshot and no backing source.
    pub fn with_config(config: Config) -> Self {
        Self {
            path: None,
            current: ArcSwap::from_pointee(config),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Re-read the source and publish a complete new snapshot. On any
    /// failure the defaults are installed (no key, empty whitelist,
    /// limit 2) and the failure is logged, never surfaced to requests.
    pub fn reload(&self) -> Arc<Config> {
        let next = match self.load_validated() {
            Ok(config) => {
                info!(
                    whitelist_entries = config.whitelist.len(),
                    max_concurrent = config.max_concurrent_per_client,
                    has_key = config.decryptor.is_some(),
                    "configuration loaded"
                );
                config
            }
            Err(ConfigError::NoSource) => {
                debug!("no config source, using defaults");
                Config::default()
            }
            Err(err) => {
                warn!(error = %err, "config load failed, installing defaults");
                Config::default()
            }
        };

        let next = Arc::new(next);
        self.current.store(next.clone());
        next
    }

    fn load_validated(&self) -> Result<Config, ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoSource)?;
        Config::try_from(ConfigFile::load(path)?)
    }

    /// The raw source as last persisted, or an empty file if unreadable.
    /// Admin updates start from this, mutate one field and persist.
    pub fn load_file(&self) -> ConfigFile {
        self.path
            .as_deref()
            .and_then(|path| ConfigFile::load(path).ok())
            .unwrap_or_default()
    }

    /// Write the source back to disk. Callers follow up with `reload()` so
    /// admin updates and external edits share one code path.
    pub fn persist(&self, file: &ConfigFile) -> Result<(), ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoSource)?;
        let raw = serde_json::to_string_pretty(file)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
