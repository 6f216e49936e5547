//! Owners and their cell declarations
//!
//! An [`Owner`] enumerates its persisted cells through a [`CellSet`]. The
//! registry consumes that list; nothing is discovered implicitly.

use std::sync::Arc;

use crate::cell::{ErasedCell, PersistedCell};
use crate::value::PersistValue;

/// Capability shared by every entity that declares persisted cells
pub trait Owner: Send + Sync {
    /// Stable, human-readable storage name, e.g. `feature.someFeature`
    fn storage_name(&self) -> String;

    /// Instance id for members of a dynamic group
    fn instance_id(&self) -> Option<u32> {
        None
    }

    /// Declared cells, in declaration order
    fn persisted_cells(&self) -> CellSet;

    /// Called after the load path has populated this owner's cells
    fn on_persisted_load(&self) {}
}

/// One declared cell
#[derive(Debug, Clone)]
pub struct CellDecl {
    field: String,
    cell: Arc<dyn ErasedCell>,
    i18n_key: Option<String>,
}

impl CellDecl {
    /// Field name under which the cell is stored
    #[inline]
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Erased cell handle
    #[inline]
    #[must_use]
    pub fn cell(&self) -> &Arc<dyn ErasedCell> {
        &self.cell
    }

    /// Display-key override for the UI layer
    #[inline]
    #[must_use]
    pub fn i18n_key(&self) -> Option<&str> {
        self.i18n_key.as_deref()
    }
}

/// Ordered list of an owner's cell declarations
///
/// ```
/// use stow_core::{CellSet, PersistedCell};
///
/// let enabled = PersistedCell::new(true);
/// let radius = PersistedCell::new(20_u32);
///
/// let cells = CellSet::new()
///     .cell("userEnabled", &enabled)
///     .cell_with_key("radius", &radius, "feature.minimap.radius.name");
/// assert_eq!(cells.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CellSet {
    decls: Vec<CellDecl>,
}

impl CellSet {
    /// Create empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a cell under `field`
    #[must_use]
    pub fn cell<T: PersistValue>(mut self, field: impl Into<String>, cell: &PersistedCell<T>) -> Self {
        self.decls.push(CellDecl {
            field: field.into(),
            cell: cell.erased(),
            i18n_key: None,
        });
        self
    }

    /// Declare a cell with a display-key override
    #[must_use]
    pub fn cell_with_key<T: PersistValue>(
        mut self,
        field: impl Into<String>,
        cell: &PersistedCell<T>,
        i18n_key: impl Into<String>,
    ) -> Self {
        self.decls.push(CellDecl {
            field: field.into(),
            cell: cell.erased(),
            i18n_key: Some(i18n_key.into()),
        });
        self
    }

    /// Append all declarations of another set (e.g. a base owner's cells)
    #[must_use]
    pub fn extend(mut self, other: CellSet) -> Self {
        self.decls.extend(other.decls);
        self
    }

    /// Iterate declarations in order
    pub fn iter(&self) -> impl Iterator<Item = &CellDecl> {
        self.decls.iter()
    }

    /// Number of declarations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Whether no cells are declared
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

impl IntoIterator for CellSet {
    type Item = CellDecl;
    type IntoIter = std::vec::IntoIter<CellDecl>;

    fn into_iter(self) -> Self::IntoIter {
        self.decls.into_iter()
    }
}
