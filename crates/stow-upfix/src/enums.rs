//! Enum value renames
//!
//! Serialized enums are stored by variant name. When a variant is renamed,
//! stored strings must follow. Values are selected either by explicit
//! storage keys or by the declared type recorded in the cell metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use stow_core::{Metadata, StoredDocument};

use crate::chain::Upfixer;
use crate::error::UpfixError;

/// Which stored values an [`EnumRenameUpfixer`] rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumSelector {
    /// Exactly these storage keys
    Keys(Vec<String>),
    /// Every cell whose declared type mentions this type path
    ///
    /// The whole path must appear, so `Option<Mode>` and `Vec<Mode>` cells
    /// are included along with plain `Mode` cells, but `ModeSet` is not.
    Type(&'static str),
}

/// Upfixer that rewrites stored enum variant names
#[derive(Debug, Clone)]
pub struct EnumRenameUpfixer {
    name: String,
    selector: EnumSelector,
    variants: BTreeMap<String, String>,
}

impl EnumRenameUpfixer {
    /// Rewrite values under explicit storage keys
    #[must_use]
    pub fn for_keys<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            selector: EnumSelector::Keys(keys.into_iter().map(Into::into).collect()),
            variants: BTreeMap::new(),
        }
    }

    /// Rewrite values of every cell whose declared type mentions `T`
    #[must_use]
    pub fn for_type<T: ?Sized>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: EnumSelector::Type(std::any::type_name::<T>()),
            variants: BTreeMap::new(),
        }
    }

    /// Map an old variant name to a new one
    #[must_use]
    pub fn variant(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.variants.insert(from.into(), to.into());
        self
    }

    /// Configured selector
    #[inline]
    #[must_use]
    pub fn selector(&self) -> &EnumSelector {
        &self.selector
    }

    fn selected_keys(&self, cells: &[Arc<Metadata>]) -> Vec<String> {
        match &self.selector {
            EnumSelector::Keys(keys) => keys.clone(),
            EnumSelector::Type(type_name) => cells
                .iter()
                .filter(|meta| names_type(meta.type_name(), type_name))
                .map(|meta| meta.storage_key().to_string())
                .collect(),
        }
    }

    /// Rewrite matching strings in place, descending into arrays and maps
    fn rewrite(&self, value: &mut Value) -> bool {
        match value {
            Value::String(s) => match self.variants.get(s.as_str()) {
                Some(to) if to.as_str() != s.as_str() => {
                    *s = to.clone();
                    true
                }
                _ => false,
            },
            Value::Array(items) => items.iter_mut().fold(false, |acc, item| self.rewrite(item) | acc),
            Value::Object(map) => map.values_mut().fold(false, |acc, item| self.rewrite(item) | acc),
            _ => false,
        }
    }
}

impl Upfixer for EnumRenameUpfixer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, document: &mut StoredDocument, cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        let mut changed = false;
        for key in self.selected_keys(cells) {
            if let Some(value) = document.get_mut(&key) {
                changed |= self.rewrite(value);
            }
        }
        Ok(changed)
    }
}

/// Whether `declared` mentions the type path `wanted` as a whole, on its
/// own or as a generic argument (`Option<app::Mode>` yes, `app::ModeSet` no)
fn names_type(declared: &str, wanted: &str) -> bool {
    const OPEN: &[char] = &['<', ',', ' ', '(', '[', '&'];
    const CLOSE: &[char] = &['<', '>', ',', ' ', ')', ']', ';'];

    declared.match_indices(wanted).any(|(at, _)| {
        let before = declared[..at].chars().next_back();
        let after = declared[at + wanted.len()..].chars().next();
        before.map_or(true, |c| OPEN.contains(&c)) && after.map_or(true, |c| CLOSE.contains(&c))
    })
}
