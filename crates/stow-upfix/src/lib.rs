//! Stow Upfix
//!
//! One-shot, idempotent migrations of stored documents.
//!
//! Each [`Upfixer`] has a stable name. Once it succeeds its name is appended
//! to the document's applied list and it never runs against that document
//! again. The [`UpfixerChain`] isolates failures: an upfixer that errors or
//! panics leaves the document as it found it and is retried next time.
//!
//! Reusable upfixers:
//! - [`RenameKeysUpfixer`]: move values after an owner or field rename
//! - [`EnumRenameUpfixer`]: follow renamed enum variants
//! - [`FnUpfixer`]: wrap a closure
//!
//! ## Example
//!
//! ```rust,ignore
//! use stow_upfix::{RenameKeysUpfixer, UpfixerChain};
//!
//! let chain = UpfixerChain::new()
//!     .with(RenameKeysUpfixer::new("2024-map-rename").prefix("feature.map", "feature.minimap"))?;
//!
//! let report = chain.run(&mut document, &registry.fixed_metadata());
//! if report.changed {
//!     store.save(&document)?;
//! }
//! ```

pub mod chain;
pub mod enums;
pub mod error;
pub mod func;
pub mod rename;

pub use chain::{FailedUpfixer, UpfixReport, Upfixer, UpfixerChain};
pub use enums::{EnumRenameUpfixer, EnumSelector};
pub use error::{UpfixError, UpfixResult};
pub use func::FnUpfixer;
pub use rename::{RenameKeysUpfixer, RenameRule};
