//! Engine configuration.
//!
//! A [`StorageConfiguration`] selects the backend once and carries the options
//! every engine it opens shares. It can be built in code, or loaded from TOML
//! with `KNOWLEDGE_STORE_*` environment overrides:
//!
//! ```toml
//! backend = "disk"
//! root_directory = "/var/lib/models"
//! cache_size = 10000
//! separator = "/"
//! ```

use crate::error::{Result, StorageError};
use crate::persistence::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default separator between a base storage name and a bundle tag.
pub const DEFAULT_SEPARATOR: &str = "/";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Which engine implementation a configuration opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Everything resident in memory; named objects snapshotted to files.
    InMemory,
    /// Big maps in paged partition files with a hot-entry cache.
    Disk,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::InMemory => "in_memory",
            BackendKind::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfiguration {
    pub backend: BackendKind,
    /// Where storage roots live; one subdirectory per storage name.
    pub root_directory: PathBuf,
    /// Entries cached per primary-partition map. `0` disables caching.
    pub cache_size: usize,
    /// Reserved; accepted and ignored.
    pub compressed: bool,
    /// Reserved; accepted and ignored.
    pub asynchronous: bool,
    /// Joins a bundle's base name and its tags.
    pub separator: String,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            root_directory: std::env::temp_dir().join("knowledge-store"),
            cache_size: 0,
            compressed: false,
            asynchronous: false,
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

impl StorageConfiguration {
    pub fn in_memory(root_directory: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::InMemory,
            root_directory: root_directory.into(),
            ..Self::default()
        }
    }

    pub fn disk(root_directory: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Disk,
            root_directory: root_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: StorageConfiguration = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// Recognized variables: `KNOWLEDGE_STORE_BACKEND`,
    /// `KNOWLEDGE_STORE_ROOT_DIRECTORY`, `KNOWLEDGE_STORE_CACHE_SIZE`,
    /// `KNOWLEDGE_STORE_SEPARATOR`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn apply_env_overrides(&mut self) -> std::result::Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("KNOWLEDGE_STORE_BACKEND") {
            self.backend = match val.as_str() {
                "in_memory" => BackendKind::InMemory,
                "disk" => BackendKind::Disk,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "Invalid KNOWLEDGE_STORE_BACKEND: {other}"
                    )))
                }
            };
        }
        if let Some(val) = lookup("KNOWLEDGE_STORE_ROOT_DIRECTORY") {
            self.root_directory = PathBuf::from(val);
        }
        if let Some(val) = lookup("KNOWLEDGE_STORE_CACHE_SIZE") {
            self.cache_size = val.parse().map_err(|_| {
                ConfigError::Validation("Invalid KNOWLEDGE_STORE_CACHE_SIZE".to_string())
            })?;
        }
        if let Some(val) = lookup("KNOWLEDGE_STORE_SEPARATOR") {
            self.separator = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.separator.is_empty() {
            return Err(ConfigError::Validation("separator must not be empty".into()));
        }
        if self.separator == "." || self.separator == ".." {
            return Err(ConfigError::Validation(format!(
                "separator {:?} collides with relative path components",
                self.separator
            )));
        }
        if self.root_directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation("root_directory must not be empty".into()));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Open an engine for `storage_name` with the configured backend.
    pub fn open(&self, storage_name: &str) -> Result<Engine> {
        self.validate()
            .map_err(|e| StorageError::InvalidConfiguration(e.to_string()))?;
        Engine::open(storage_name, self)
    }

    /// Compose a bundle member's storage name: `<base><separator><tag>`.
    pub fn compose_name(&self, base: &str, tag: &str) -> Result<String> {
        let well_formed = !tag.is_empty()
            && tag
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !well_formed || tag.contains(self.separator.as_str()) {
            return Err(StorageError::InvalidConfiguration(format!(
                "invalid tag {tag:?}: tags are lowercase ASCII letters, digits or '_', without {:?}",
                self.separator
            )));
        }
        Ok(format!("{base}{}{tag}", self.separator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = StorageConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::InMemory);
        assert_eq!(config.cache_size, 0);
        assert_eq!(config.separator, "/");
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        fs::write(&path, "backend = \"disk\"\ncache_size = 64\n").unwrap();

        let config = StorageConfiguration::from_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Disk);
        assert_eq!(config.cache_size, 64);
        assert_eq!(config.separator, DEFAULT_SEPARATOR);

        let rendered = config.to_toml_string().unwrap();
        let parsed: StorageConfiguration = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn overrides_take_priority() {
        let env: HashMap<&str, &str> = [
            ("KNOWLEDGE_STORE_BACKEND", "disk"),
            ("KNOWLEDGE_STORE_CACHE_SIZE", "128"),
            ("KNOWLEDGE_STORE_SEPARATOR", "::"),
        ]
        .into_iter()
        .collect();

        let mut config = StorageConfiguration::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend, BackendKind::Disk);
        assert_eq!(config.cache_size, 128);
        assert_eq!(config.separator, "::");
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = StorageConfiguration::default();
        let err = config
            .apply_overrides(|k| (k == "KNOWLEDGE_STORE_CACHE_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn empty_separator_is_invalid() {
        let config = StorageConfiguration::default().with_separator("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn compose_name_rejects_separator_in_tag() {
        let config = StorageConfiguration::default();
        assert_eq!(config.compose_name("model", "fs0").unwrap(), "model/fs0");
        assert!(matches!(
            config.compose_name("model", "a/b"),
            Err(StorageError::InvalidConfiguration(_))
        ));
        assert!(config.compose_name("model", "").is_err());
        assert!(config.compose_name("model", "é").is_err());
    }
}
