//! Error types for stow-engine

use std::path::PathBuf;

use stow_core::{CoreError, SchemaError};
use stow_upfix::UpfixError;

use crate::lifecycle::DocumentState;

/// Storage target failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem operation failed
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document could not be encoded
    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),

    /// Write refused by the target
    #[error("write rejected by {0}")]
    Rejected(String),
}

impl StorageError {
    /// Create i/o error for a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config values are inconsistent
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    /// Create invalid-value error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Document lifecycle violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Transition not in the lifecycle table
    #[error("illegal document transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: DocumentState,
        /// Requested state
        to: DocumentState,
    },

    /// `init` was called on an initialized engine
    #[error("engine already initialized")]
    AlreadyInitialized,

    /// Operation needs a completed `init`
    #[error("engine not initialized")]
    NotInitialized,
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Core failure (lookups, conversions, groups)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Malformed owner declaration
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaError),

    /// Storage target failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration failure
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle violation
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Upfixer chain could not be built
    #[error("upfixer error: {0}")]
    Upfix(#[from] UpfixError),

    /// No dynamic group registered under this key
    #[error("unknown dynamic group '{0}'")]
    UnknownGroup(String),

    /// Engine built outside a tokio runtime and no handle was supplied
    #[error("no tokio runtime available for background writes")]
    NoRuntime,

    /// Engine was shut down
    #[error("engine is shut down")]
    ShutDown,
}

impl EngineError {
    /// Whether the host should abort start-up on this error
    ///
    /// Schema violations and misconfiguration are defects; everything else
    /// is logged and recovered from.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Schema(_) | Self::Config(_) | Self::Upfix(_) | Self::NoRuntime => true,
            Self::Core(err) => matches!(err, CoreError::Schema(_)),
            Self::Lifecycle(_) | Self::Storage(_) | Self::UnknownGroup(_) | Self::ShutDown => false,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
