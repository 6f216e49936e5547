//! Stored document
//!
//! Flat JSON object mapping storage keys to raw values, with two reserved
//! entries:
//! - [`UPFIXERS_KEY`]: ordered array of applied upfixer names
//! - [`GROUPS_KEY`]: object mapping group key to an ordered id array
//!
//! Reserved keys start with `$`, which the registry forbids in owner and
//! field names, so they can never collide with a storage key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key holding the applied upfixer names
pub const UPFIXERS_KEY: &str = "$upfixers";

/// Reserved key holding the dynamic group id lists
pub const GROUPS_KEY: &str = "$groups";

/// Whether `key` is one of the reserved entries
#[inline]
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with('$')
}

/// Raw persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredDocument {
    entries: Map<String, Value>,
}

impl StoredDocument {
    /// Create empty document
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object
    #[inline]
    #[must_use]
    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self { entries }
    }

    /// Parse from JSON text; the top level must be an object
    ///
    /// # Errors
    /// Returns the parser error for invalid JSON or a non-object top level.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Parse from JSON bytes; the top level must be an object
    ///
    /// # Errors
    /// Returns the parser error for invalid JSON or a non-object top level.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Pretty-printed JSON text
    ///
    /// # Errors
    /// Only fails on writer errors, which cannot happen for a `String`.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries)
    }

    /// Underlying object
    #[inline]
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// Consume into the underlying object
    #[inline]
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.entries
    }

    /// Raw entry by key (reserved keys included)
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Mutable raw entry by key
    #[inline]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    /// Insert an entry, returning the previous value
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Remove an entry
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Whether an entry exists
    #[inline]
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Move the value at `from` to `to`
    ///
    /// Returns `false` (and changes nothing) if `from` is absent or `to` is
    /// already occupied.
    pub fn rename_key(&mut self, from: &str, to: &str) -> bool {
        if from == to || self.entries.contains_key(to) {
            return false;
        }
        match self.entries.remove(from) {
            Some(value) => {
                self.entries.insert(to.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Storage keys of persisted values, reserved entries excluded
    pub fn value_keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|k| !is_reserved_key(k))
    }

    /// Number of persisted values, reserved entries excluded
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.value_keys().count()
    }

    /// Whether the document holds nothing at all
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applied upfixer names
    ///
    /// A missing list, a non-array, or an array holding anything but strings
    /// all read as "nothing applied".
    #[must_use]
    pub fn applied_upfixers(&self) -> Vec<String> {
        let Some(Value::Array(items)) = self.entries.get(UPFIXERS_KEY) else {
            return Vec::new();
        };
        items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default()
    }

    /// Append an upfixer name to the applied list
    ///
    /// A malformed list reads as empty, so it is replaced by `[name]`.
    pub fn record_upfixer(&mut self, name: &str) {
        let mut applied = self.applied_upfixers();
        if applied.iter().any(|n| n == name) {
            return;
        }
        applied.push(name.to_string());
        self.entries.insert(
            UPFIXERS_KEY.to_string(),
            Value::Array(applied.into_iter().map(Value::String).collect()),
        );
    }

    /// Recorded id list of one group
    ///
    /// `None` if the group is not recorded or its entry is malformed.
    #[must_use]
    pub fn group_ids(&self, group_key: &str) -> Option<Vec<u32>> {
        let Value::Array(items) = self.entries.get(GROUPS_KEY)?.get(group_key)? else {
            return None;
        };
        items
            .iter()
            .map(|item| item.as_u64().and_then(|id| u32::try_from(id).ok()))
            .collect()
    }

    /// All well-formed group id lists
    #[must_use]
    pub fn groups(&self) -> BTreeMap<String, Vec<u32>> {
        let Some(Value::Object(groups)) = self.entries.get(GROUPS_KEY) else {
            return BTreeMap::new();
        };
        groups
            .keys()
            .filter_map(|key| self.group_ids(key).map(|ids| (key.clone(), ids)))
            .collect()
    }

    /// Replace the whole group mapping
    pub fn set_groups(&mut self, groups: &BTreeMap<String, Vec<u32>>) {
        let object: Map<String, Value> = groups
            .iter()
            .map(|(key, ids)| {
                let ids = ids.iter().copied().map(Value::from).collect();
                (key.clone(), Value::Array(ids))
            })
            .collect();
        self.entries.insert(GROUPS_KEY.to_string(), Value::Object(object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> StoredDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        assert!(StoredDocument::from_json_str("[1, 2]").is_err());
        assert!(StoredDocument::from_json_str("{}").unwrap().is_empty());
    }

    #[test]
    fn value_keys_skip_reserved_entries() {
        let d = doc(json!({
            "feature.a.x": 1,
            "$upfixers": ["one"],
            "$groups": {},
        }));
        assert_eq!(d.value_keys().collect::<Vec<_>>(), vec!["feature.a.x"]);
        assert_eq!(d.value_count(), 1);
    }

    #[test]
    fn applied_upfixers_missing_or_malformed_is_empty() {
        assert!(StoredDocument::new().applied_upfixers().is_empty());
        assert!(doc(json!({"$upfixers": "one"})).applied_upfixers().is_empty());
        assert!(doc(json!({"$upfixers": ["one", 2]})).applied_upfixers().is_empty());
        assert_eq!(
            doc(json!({"$upfixers": ["one", "two"]})).applied_upfixers(),
            vec!["one", "two"]
        );
    }

    #[test]
    fn record_upfixer_appends_once() {
        let mut d = doc(json!({"$upfixers": ["one"]}));
        d.record_upfixer("two");
        d.record_upfixer("two");
        assert_eq!(d.get(UPFIXERS_KEY), Some(&json!(["one", "two"])));
    }

    #[test]
    fn record_upfixer_repairs_malformed_list() {
        let mut d = doc(json!({"$upfixers": 17}));
        d.record_upfixer("one");
        assert_eq!(d.applied_upfixers(), vec!["one"]);

        let mut d = doc(json!({"$upfixers": ["a", "b", 3]}));
        d.record_upfixer("c");
        assert_eq!(d.get(UPFIXERS_KEY), Some(&json!(["c"])));
    }

    #[test]
    fn group_ids_preserve_order() {
        let d = doc(json!({"$groups": {"bars": [5, 1, 3], "bad": [1, "x"], "neg": [-1]}}));
        assert_eq!(d.group_ids("bars"), Some(vec![5, 1, 3]));
        assert_eq!(d.group_ids("bad"), None);
        assert_eq!(d.group_ids("neg"), None);
        assert_eq!(d.group_ids("missing"), None);
        assert_eq!(d.groups().len(), 1);
    }

    #[test]
    fn set_groups_round_trips() {
        let mut groups = BTreeMap::new();
        groups.insert("boxes".to_string(), vec![3, 1, 2]);
        let mut d = StoredDocument::new();
        d.set_groups(&groups);
        assert_eq!(d.groups(), groups);
    }

    #[test]
    fn rename_key_never_clobbers() {
        let mut d = doc(json!({"old.a": 1, "new.b": 2}));
        assert!(!d.rename_key("old.a", "new.b"));
        assert!(!d.rename_key("missing", "new.c"));
        assert!(d.rename_key("old.a", "new.a"));
        assert_eq!(d.get("new.a"), Some(&json!(1)));
        assert!(!d.contains_key("old.a"));
    }
}
