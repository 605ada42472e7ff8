//! Proxy configuration persistence.
//!
//! The record is stored as pretty-printed JSON. Writes go to a temp file
//! first and are renamed into place so a reader never sees a partial file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::proxy::ProxyConfig;

/// JSON file store for [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration.
    ///
    /// Returns the default record if the file doesn't exist. Returns an error
    /// if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<ProxyConfig, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                return Ok(ProxyConfig::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut config: ProxyConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if config.normalize() {
            warn!(
                path = %self.path.display(),
                current_target_port = config.current_target_port,
                "Config file had an inconsistent target set, repaired"
            );
        }

        Ok(config)
    }

    /// Save the configuration atomically.
    pub fn save(&self, config: &ProxyConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(config)?;

        fs::write(&tmp_path, content).map_err(|source| ConfigError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            path = %self.path.display(),
            listen_port = config.listen_port,
            current_target_port = config.current_target_port,
            is_enabled = config.is_enabled,
            "Saved config"
        );

        Ok(())
    }

    /// Delete the stored file and return the defaults.
    pub fn reset(&self) -> Result<ProxyConfig, ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Config reset to defaults"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        Ok(ProxyConfig::default())
    }
}
