//! Storage key renames
//!
//! Used when an owner or field is renamed between versions. Each rule moves
//! values from an old key (or key prefix) to the new one. An existing value
//! under the new key always wins; the stale old entry is dropped.

use std::sync::Arc;

use stow_core::{Metadata, StoredDocument};

use crate::chain::Upfixer;
use crate::error::UpfixError;

/// One rename rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameRule {
    /// Rename exactly one storage key
    Key {
        /// Old storage key
        from: String,
        /// New storage key
        to: String,
    },
    /// Rename every key under a dotted prefix, e.g. an owner storage name
    Prefix {
        /// Old prefix, without trailing dot
        from: String,
        /// New prefix, without trailing dot
        to: String,
    },
}

impl RenameRule {
    fn target(&self, key: &str) -> Option<String> {
        match self {
            Self::Key { from, to } => (key == from).then(|| to.clone()),
            Self::Prefix { from, to } => {
                let rest = key.strip_prefix(from.as_str())?;
                if rest.is_empty() || rest.starts_with('.') {
                    Some(format!("{to}{rest}"))
                } else {
                    None
                }
            }
        }
    }
}

/// Upfixer that renames storage keys
#[derive(Debug, Clone)]
pub struct RenameKeysUpfixer {
    name: String,
    rules: Vec<RenameRule>,
}

impl RenameKeysUpfixer {
    /// Create upfixer with no rules
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Add an exact key rename
    #[must_use]
    pub fn key(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(RenameRule::Key {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Add a prefix rename (`feature.old` -> `feature.new` moves
    /// `feature.old.radius` to `feature.new.radius`)
    #[must_use]
    pub fn prefix(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rules.push(RenameRule::Prefix {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Configured rules
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &[RenameRule] {
        &self.rules
    }
}

impl Upfixer for RenameKeysUpfixer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, document: &mut StoredDocument, _cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        let mut changed = false;

        for rule in &self.rules {
            let moves: Vec<(String, String)> = document
                .value_keys()
                .filter_map(|key| rule.target(key).map(|to| (key.to_string(), to)))
                .filter(|(from, to)| from != to)
                .collect();

            for (from, to) in moves {
                if !document.rename_key(&from, &to) {
                    document.remove(&from);
                    tracing::debug!(from = %from, to = %to, "dropped stale key, new key already present");
                }
                changed = true;
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn doc(value: Value) -> StoredDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn renames_exact_key() {
        let upfixer = RenameKeysUpfixer::new("rename-radius").key("feature.map.size", "feature.map.radius");
        let mut d = doc(json!({"feature.map.size": 3, "feature.map.sizeLimit": 9}));

        assert!(upfixer.apply(&mut d, &[]).unwrap());
        assert_eq!(d, doc(json!({"feature.map.radius": 3, "feature.map.sizeLimit": 9})));
    }

    #[test]
    fn renames_prefix_on_segment_boundary() {
        let upfixer = RenameKeysUpfixer::new("rename-owner").prefix("feature.map", "feature.minimap");
        let mut d = doc(json!({
            "feature.map.radius": 3,
            "feature.map.zoom": 2,
            "feature.mapper.x": 1,
            "$upfixers": [],
        }));

        assert!(upfixer.apply(&mut d, &[]).unwrap());
        assert_eq!(
            d,
            doc(json!({
                "feature.minimap.radius": 3,
                "feature.minimap.zoom": 2,
                "feature.mapper.x": 1,
                "$upfixers": [],
            }))
        );
    }

    #[test]
    fn existing_new_key_wins() {
        let upfixer = RenameKeysUpfixer::new("r").key("old", "new");
        let mut d = doc(json!({"old": 1, "new": 2}));

        assert!(upfixer.apply(&mut d, &[]).unwrap());
        assert_eq!(d, doc(json!({"new": 2})));
    }

    #[test]
    fn second_application_is_a_no_op() {
        let upfixer = RenameKeysUpfixer::new("r").key("a.b.c", "a.b.d").prefix("x", "y");
        let mut d = doc(json!({"a.b.c": 1, "x.q": 2}));

        assert!(upfixer.apply(&mut d, &[]).unwrap());
        let once = d.clone();
        assert!(!upfixer.apply(&mut d, &[]).unwrap());
        assert_eq!(d, once);
    }
}
