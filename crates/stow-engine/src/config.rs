//! Engine configuration
//!
//! ```toml
//! storage_dir = "/home/me/.config/app"
//! identity = "player-1"
//! min_save_interval_ms = 10000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default minimum time between two scheduled writes
pub const DEFAULT_MIN_SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default storage file suffix
pub const DEFAULT_FILE_SUFFIX: &str = ".conf.json";

/// Default base name of the exported defaults document
pub const DEFAULT_DEFAULTS_NAME: &str = "default";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the managed documents
    pub storage_dir: PathBuf,
    /// Identity the user document is named after
    pub identity: String,
    /// Suffix appended to every document name
    pub file_suffix: String,
    /// Base name of the exported defaults document
    pub defaults_name: String,
    /// Minimum time between scheduled writes, in milliseconds
    pub min_save_interval_ms: u64,
    /// Whether `init` exports the defaults document
    pub export_defaults: bool,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With storage directory
    #[inline]
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// With document identity
    #[inline]
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// With file suffix
    #[inline]
    #[must_use]
    pub fn with_file_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.file_suffix = suffix.into();
        self
    }

    /// With minimum save interval
    #[inline]
    #[must_use]
    pub fn with_min_save_interval(mut self, interval: Duration) -> Self {
        self.min_save_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With defaults export toggled
    #[inline]
    #[must_use]
    pub fn with_export_defaults(mut self, export: bool) -> Self {
        self.export_defaults = export;
        self
    }

    /// Minimum save interval as a duration
    #[inline]
    #[must_use]
    pub fn min_save_interval(&self) -> Duration {
        Duration::from_millis(self.min_save_interval_ms)
    }

    /// Path of the user document
    #[must_use]
    pub fn user_document_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}{}", self.identity, self.file_suffix))
    }

    /// Path of the exported defaults document
    #[must_use]
    pub fn defaults_document_path(&self) -> PathBuf {
        self.storage_dir.join(format!("{}{}", self.defaults_name, self.file_suffix))
    }

    /// Check values for consistency
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("identity", &self.identity)?;
        validate_name("defaults_name", &self.defaults_name)?;
        if self.file_suffix.is_empty() {
            return Err(ConfigError::invalid("file_suffix", "must not be empty"));
        }
        if self.file_suffix.contains(['/', '\\']) {
            return Err(ConfigError::invalid("file_suffix", "must not contain path separators"));
        }
        if self.identity == self.defaults_name {
            return Err(ConfigError::invalid("identity", "collides with the defaults document name"));
        }
        Ok(())
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Io`], [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if value.contains(['/', '\\']) || value == "." || value == ".." {
        return Err(ConfigError::invalid(field, "must be a plain file name"));
    }
    Ok(())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("."),
            identity: "settings".to_string(),
            file_suffix: DEFAULT_FILE_SUFFIX.to_string(),
            defaults_name: DEFAULT_DEFAULTS_NAME.to_string(),
            min_save_interval_ms: 10_000,
            export_defaults: true,
        }
    }
}
