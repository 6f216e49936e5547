//! Error types for stow-upfix

/// Upfixer failures
#[derive(Debug, thiserror::Error)]
pub enum UpfixError {
    /// Two upfixers in one chain share a name
    #[error("upfixer '{0}' is already part of the chain")]
    DuplicateName(String),

    /// An entry the upfixer needs has an unexpected shape
    #[error("malformed entry '{key}': {reason}")]
    Malformed {
        /// Storage key of the entry
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Upfixer-specific failure
    #[error("{0}")]
    Failed(String),

    /// JSON conversion failed inside an upfixer
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpfixError {
    /// Create malformed-entry error
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create free-form failure
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result type alias for upfixer operations
pub type UpfixResult<T> = Result<T, UpfixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            UpfixError::DuplicateName("rename".into()).to_string(),
            "upfixer 'rename' is already part of the chain"
        );
        assert_eq!(
            UpfixError::malformed("feature.a.x", "expected a string").to_string(),
            "malformed entry 'feature.a.x': expected a string"
        );
    }
}
