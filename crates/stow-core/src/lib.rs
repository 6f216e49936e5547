//! Stow Core
//!
//! Building blocks of the persistence engine:
//! - [`PersistedCell`]: a typed value with change notification
//! - [`Owner`] / [`DynamicGroup`]: entities that declare persisted cells
//! - [`MetadataRegistry`]: the single source of truth for what is persisted
//! - [`StoredDocument`]: the flat key/value document written to disk
//!
//! ## Example
//!
//! ```rust,ignore
//! use stow_core::{CellSet, MetadataRegistry, Owner, PersistedCell};
//!
//! struct Minimap {
//!     radius: PersistedCell<u32>,
//! }
//!
//! impl Owner for Minimap {
//!     fn storage_name(&self) -> String {
//!         "feature.minimap".into()
//!     }
//!
//!     fn persisted_cells(&self) -> CellSet {
//!         CellSet::new().cell("radius", &self.radius)
//!     }
//! }
//!
//! let minimap = Minimap { radius: PersistedCell::new(20) };
//! let mut registry = MetadataRegistry::new();
//! registry.register(&minimap)?;
//! assert_eq!(registry.lookup(minimap.radius.id())?.storage_key(), "feature.minimap.radius");
//! ```

pub mod cell;
pub mod document;
pub mod error;
pub mod group;
pub mod metadata;
pub mod owner;
pub mod value;

pub use cell::{CellId, ErasedCell, PersistedCell, TouchListener};
pub use document::{is_reserved_key, StoredDocument, GROUPS_KEY, UPFIXERS_KEY};
pub use error::{CoreError, CoreResult, SchemaError};
pub use group::DynamicGroup;
pub use metadata::{storage_key, Metadata, MetadataRegistry, RegisteredCell};
pub use owner::{CellDecl, CellSet, Owner};
pub use value::{deep_copy, from_raw, to_raw, PersistValue};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
