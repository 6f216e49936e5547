//! Closure-backed upfixers for one-off migrations

use std::fmt;
use std::sync::Arc;

use stow_core::{Metadata, StoredDocument};

use crate::chain::Upfixer;
use crate::error::UpfixError;

type ApplyFn = dyn Fn(&mut StoredDocument, &[Arc<Metadata>]) -> Result<bool, UpfixError> + Send + Sync;

/// Upfixer wrapping a closure
///
/// ```
/// use stow_upfix::{FnUpfixer, Upfixer};
/// use stow_core::StoredDocument;
///
/// let drop_legacy = FnUpfixer::new("drop-legacy-flag", |doc, _cells| {
///     Ok(doc.remove("feature.legacy.enabled").is_some())
/// });
///
/// let mut doc = StoredDocument::new();
/// assert!(!drop_legacy.apply(&mut doc, &[]).unwrap());
/// ```
pub struct FnUpfixer {
    name: String,
    apply: Box<ApplyFn>,
}

impl FnUpfixer {
    /// Create upfixer from a name and closure
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut StoredDocument, &[Arc<Metadata>]) -> Result<bool, UpfixError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }
}

impl fmt::Debug for FnUpfixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnUpfixer").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Upfixer for FnUpfixer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, document: &mut StoredDocument, cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        (self.apply)(document, cells)
    }
}
