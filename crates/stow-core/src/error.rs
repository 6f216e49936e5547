//! Error types for stow-core
//!
//! Two families:
//! - [`SchemaError`]: malformed owner declarations. These are build-time
//!   defects and the host is expected to abort start-up on them.
//! - [`CoreError`]: everything else (lookups, value conversion, groups).

use crate::cell::CellId;

/// Owner declaration violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Owner returned an empty storage name
    #[error("owner has an empty storage name")]
    EmptyStorageName,

    /// Storage name or prefix uses the reserved `$` namespace
    #[error("owner name '{0}' uses the reserved '$' namespace")]
    ReservedName(String),

    /// Field name is empty, contains `.`, or starts with `$`
    #[error("invalid field name '{field}' on owner '{owner}'")]
    InvalidFieldName {
        /// Owner storage name
        owner: String,
        /// Offending field
        field: String,
    },

    /// The same field name was declared twice on one owner
    #[error("field '{field}' declared twice on owner '{owner}'")]
    DuplicateField {
        /// Owner storage name
        owner: String,
        /// Duplicated field
        field: String,
    },

    /// One cell was declared under two fields
    #[error("cell declared twice on owner '{owner}' (second time as '{field}')")]
    DuplicateCell {
        /// Owner storage name
        owner: String,
        /// Field of the second declaration
        field: String,
    },

    /// Default value serialized to null on a non-nullable cell
    #[error("default value of '{0}' is null but the cell is not nullable")]
    NullDefault(String),

    /// Storage key already claimed by another cell
    #[error("storage key '{0}' is claimed by more than one cell")]
    DuplicateStorageKey(String),

    /// Two dynamic groups share a group key
    #[error("dynamic group '{0}' registered twice")]
    DuplicateGroup(String),

    /// Default value could not be captured
    #[error("default value of '{key}' cannot be serialized: {reason}")]
    UnserializableDefault {
        /// Storage key of the cell
        key: String,
        /// Serializer message
        reason: String,
    },
}

/// General stow-core errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Cell was looked up before its owner was registered
    #[error("cell {0} is not registered")]
    NotRegistered(CellId),

    /// Malformed owner declaration
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaError),

    /// Raw value does not fit the declared type
    #[error("value does not fit declared type {type_name}: {source}")]
    TypeMismatch {
        /// Declared type
        type_name: &'static str,
        /// Deserializer error
        #[source]
        source: serde_json::Error,
    },

    /// Raw null offered to a non-nullable cell
    #[error("null is not a valid value for {0}")]
    UnexpectedNull(&'static str),

    /// Value could not be serialized
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Dynamic group could not (re)create its instances
    #[error("group '{group}' failed to materialize: {reason}")]
    GroupMaterialize {
        /// Group key
        group: String,
        /// Collaborator message
        reason: String,
    },
}

impl CoreError {
    /// Create group materialization error
    pub fn group(group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GroupMaterialize {
            group: group.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error only concerns one value and loading may continue
    #[inline]
    #[must_use]
    pub fn is_value_local(&self) -> bool {
        matches!(
            self,
            Self::TypeMismatch { .. } | Self::UnexpectedNull(_) | Self::Serialize(_)
        )
    }
}

/// Result type alias for stow-core operations
pub type CoreResult<T> = Result<T, CoreError>;
