//! Upfixer trait and chain runner
//!
//! The chain owns an ordered list of named upfixers. [`UpfixerChain::run`]
//! applies every upfixer the document has not recorded yet, in declared
//! order, each inside its own failure boundary:
//!
//! 1. clone the document
//! 2. apply the upfixer to the clone (errors and panics both caught)
//! 3. on success commit the clone and record the name immediately
//! 4. on failure keep the pre-upfixer document and log a warning
//!
//! A failed upfixer is not recorded and will be retried on the next run.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use stow_core::{Metadata, StoredDocument};

use crate::error::UpfixError;

/// Named, one-shot, idempotent document migration
pub trait Upfixer: Send + Sync {
    /// Stable unique name, recorded in the document once applied
    fn name(&self) -> &str;

    /// Rewrite `document` in place, returning whether anything changed
    ///
    /// `cells` is the metadata known when the chain runs (fixed owners).
    /// Running an upfixer twice on its own output must report no change.
    ///
    /// # Errors
    /// Any [`UpfixError`]; partial edits are discarded by the chain.
    fn apply(&self, document: &mut StoredDocument, cells: &[Arc<Metadata>]) -> Result<bool, UpfixError>;
}

/// An upfixer that failed during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUpfixer {
    /// Upfixer name
    pub name: String,
    /// Error or panic message
    pub reason: String,
}

/// Outcome of one chain run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpfixReport {
    /// Upfixers that ran successfully and were recorded, in order
    pub applied: Vec<String>,
    /// Upfixers that failed and were not recorded
    pub failed: Vec<FailedUpfixer>,
    /// Whether any upfixer changed the document
    pub changed: bool,
}

impl UpfixReport {
    /// Whether nothing had to run
    #[inline]
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty()
    }
}

/// Ordered list of upfixers
#[derive(Default)]
pub struct UpfixerChain {
    upfixers: IndexMap<String, Arc<dyn Upfixer>>,
}

impl fmt::Debug for UpfixerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.upfixers.keys()).finish()
    }
}

impl UpfixerChain {
    /// Create empty chain
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an upfixer
    ///
    /// # Errors
    /// [`UpfixError::DuplicateName`] if the name is already taken.
    pub fn register(&mut self, upfixer: impl Upfixer + 'static) -> Result<(), UpfixError> {
        self.register_arc(Arc::new(upfixer))
    }

    /// Append a shared upfixer
    ///
    /// # Errors
    /// [`UpfixError::DuplicateName`] if the name is already taken.
    pub fn register_arc(&mut self, upfixer: Arc<dyn Upfixer>) -> Result<(), UpfixError> {
        let name = upfixer.name().to_string();
        if self.upfixers.contains_key(&name) {
            return Err(UpfixError::DuplicateName(name));
        }
        self.upfixers.insert(name, upfixer);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    ///
    /// # Errors
    /// [`UpfixError::DuplicateName`] if the name is already taken.
    pub fn with(mut self, upfixer: impl Upfixer + 'static) -> Result<Self, UpfixError> {
        self.register(upfixer)?;
        Ok(self)
    }

    /// Upfixer names in declared order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.upfixers.keys().map(String::as_str).collect()
    }

    /// Number of upfixers
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.upfixers.len()
    }

    /// Whether the chain is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upfixers.is_empty()
    }

    /// Names not yet recorded in `document`, in declared order
    #[must_use]
    pub fn missing(&self, document: &StoredDocument) -> Vec<&str> {
        let applied = document.applied_upfixers();
        self.upfixers
            .keys()
            .filter(|name| !applied.iter().any(|a| a == *name))
            .map(String::as_str)
            .collect()
    }

    /// Apply every missing upfixer
    pub fn run(&self, document: &mut StoredDocument, cells: &[Arc<Metadata>]) -> UpfixReport {
        let mut report = UpfixReport::default();
        let applied = document.applied_upfixers();

        for (name, upfixer) in &self.upfixers {
            if applied.iter().any(|a| a == name) {
                continue;
            }

            let mut scratch = document.clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| upfixer.apply(&mut scratch, cells)));

            match outcome {
                Ok(Ok(changed)) => {
                    scratch.record_upfixer(name);
                    *document = scratch;
                    report.changed |= changed;
                    report.applied.push(name.clone());
                    tracing::info!(upfixer = %name, changed, "applied upfixer");
                }
                Ok(Err(err)) => {
                    tracing::warn!(upfixer = %name, error = %err, "upfixer failed, will retry on next load");
                    report.failed.push(FailedUpfixer {
                        name: name.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    tracing::warn!(upfixer = %name, panic = %reason, "upfixer panicked, will retry on next load");
                    report.failed.push(FailedUpfixer {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
