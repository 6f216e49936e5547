//! Metadata and the metadata registry
//!
//! [`MetadataRegistry`] is the single source of truth for what can be
//! persisted. Cells of fixed owners are registered once; cells of dynamic
//! group members are refreshed from the live groups on every
//! [`MetadataRegistry::all_metadata`] call, so a resize is always reflected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use serde_json::Value;

use crate::cell::{CellId, ErasedCell, TouchListener};
use crate::document::is_reserved_key;
use crate::error::{CoreError, SchemaError};
use crate::group::DynamicGroup;
use crate::owner::Owner;

/// Build a storage key from its parts
///
/// `prefix.owner.field` for group members, `owner.field` otherwise.
#[must_use]
pub fn storage_key(prefix: Option<&str>, owner: &str, field: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{owner}.{field}"),
        _ => format!("{owner}.{field}"),
    }
}

/// Everything known about one persisted cell
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    owner_name: String,
    owner_prefix: Option<String>,
    instance_id: Option<u32>,
    field_name: String,
    type_name: &'static str,
    default_value: Value,
    storage_key: String,
    allows_null: bool,
    i18n_key: Option<String>,
}

impl Metadata {
    /// Owner storage name
    #[inline]
    #[must_use]
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// Group prefix (group members only)
    #[inline]
    #[must_use]
    pub fn owner_prefix(&self) -> Option<&str> {
        self.owner_prefix.as_deref()
    }

    /// Instance id (group members only)
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    /// Declared field name
    #[inline]
    #[must_use]
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Declared value type
    #[inline]
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Default value in raw form, captured at registration
    #[inline]
    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.default_value
    }

    /// Key in the stored document
    #[inline]
    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Whether null is a legal value
    #[inline]
    #[must_use]
    pub fn allows_null(&self) -> bool {
        self.allows_null
    }

    /// Display key for the UI layer, falling back to the storage key
    #[inline]
    #[must_use]
    pub fn i18n_key(&self) -> &str {
        self.i18n_key.as_deref().unwrap_or(&self.storage_key)
    }
}

/// A registered cell together with its metadata
#[derive(Debug, Clone)]
pub struct RegisteredCell {
    metadata: Arc<Metadata>,
    cell: Arc<dyn ErasedCell>,
}

impl RegisteredCell {
    /// Metadata of the cell
    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Erased cell handle
    #[inline]
    #[must_use]
    pub fn cell(&self) -> &Arc<dyn ErasedCell> {
        &self.cell
    }

    /// Current value differs from the default (deep comparison)
    ///
    /// # Errors
    /// Fails if the current value cannot be serialized.
    pub fn value_changed(&self) -> Result<bool, CoreError> {
        Ok(self.cell.to_raw()? != self.metadata.default_value)
    }

    /// Restore the default value
    ///
    /// # Errors
    /// Fails only if the captured default no longer fits the cell type.
    pub fn reset(&self) -> Result<(), CoreError> {
        self.cell.restore_raw(self.metadata.default_value.clone())
    }
}

/// Registry of every persisted cell
#[derive(Default)]
pub struct MetadataRegistry {
    fixed: IndexMap<CellId, RegisteredCell>,
    members: HashMap<CellId, RegisteredCell>,
    keys: HashMap<String, CellId>,
    listener: Option<Weak<dyn TouchListener>>,
}

impl std::fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("fixed", &self.fixed.len())
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl MetadataRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create registry that attaches `listener` to every registered cell
    #[must_use]
    pub fn with_listener(listener: Weak<dyn TouchListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::default()
        }
    }

    /// Register the cells of a fixed owner
    ///
    /// Already-registered cells are skipped. The owner is validated as a
    /// whole before anything is inserted.
    ///
    /// # Errors
    /// Any [`SchemaError`]; the registry is unchanged on error.
    pub fn register(&mut self, owner: &dyn Owner) -> Result<usize, SchemaError> {
        let built = self.build(None, owner)?;
        let count = built.len();
        for entry in built {
            self.insert_key(&entry);
            self.fixed.insert(entry.cell.id(), entry);
        }
        Ok(count)
    }

    /// Register the cells of a group member under `prefix`
    ///
    /// # Errors
    /// Any [`SchemaError`]; the registry is unchanged on error.
    pub fn register_member(&mut self, prefix: &str, owner: &dyn Owner) -> Result<Vec<CellId>, SchemaError> {
        if is_reserved_key(prefix) {
            return Err(SchemaError::ReservedName(prefix.to_string()));
        }
        let built = self.build(Some(prefix), owner)?;
        let ids = built.iter().map(|entry| entry.cell.id()).collect();
        for entry in built {
            self.insert_key(&entry);
            self.members.insert(entry.cell.id(), entry);
        }
        Ok(ids)
    }

    /// Bring member registrations in line with the live groups
    ///
    /// Registers cells of new instances (capturing their defaults now) and
    /// forgets cells of instances that no longer exist. Returns the ids of
    /// newly registered cells.
    ///
    /// # Errors
    /// Any [`SchemaError`] raised by a new member.
    pub fn refresh_members(&mut self, groups: &[Arc<dyn DynamicGroup>]) -> Result<Vec<CellId>, SchemaError> {
        let current: Vec<(String, Vec<Arc<dyn Owner>>)> = groups
            .iter()
            .map(|group| (group.member_prefix(), group.members()))
            .collect();
        let live: HashSet<CellId> = current
            .iter()
            .flat_map(|(_, members)| members.iter())
            .flat_map(|member| member.persisted_cells().iter().map(|d| d.cell().id()).collect::<Vec<_>>())
            .collect();

        // evict first: a rebuilt instance reuses the storage keys of the one it replaces
        let stale: Vec<CellId> = self.members.keys().filter(|id| !live.contains(id)).copied().collect();
        for id in stale {
            if let Some(entry) = self.members.remove(&id) {
                self.keys.remove(entry.metadata.storage_key());
            }
        }

        let mut fresh = Vec::new();
        for (prefix, members) in &current {
            for member in members {
                let registered = member
                    .persisted_cells()
                    .iter()
                    .all(|d| self.members.contains_key(&d.cell().id()));
                if !registered {
                    fresh.extend(self.register_member(prefix, member.as_ref())?);
                }
            }
        }

        Ok(fresh)
    }

    /// Live view of every persisted cell: fixed owners first, in
    /// registration order, then group members in group/member/field order
    ///
    /// # Errors
    /// Any [`SchemaError`] raised while registering new members.
    pub fn all_metadata(&mut self, groups: &[Arc<dyn DynamicGroup>]) -> Result<Vec<RegisteredCell>, SchemaError> {
        self.refresh_members(groups)?;

        let mut all: Vec<RegisteredCell> = self.fixed.values().cloned().collect();
        for group in groups {
            for member in group.members() {
                all.extend(
                    member
                        .persisted_cells()
                        .iter()
                        .filter_map(|decl| self.members.get(&decl.cell().id()).cloned()),
                );
            }
        }
        Ok(all)
    }

    /// Metadata of a registered cell
    ///
    /// # Errors
    /// [`CoreError::NotRegistered`] if the cell's owner was never registered.
    pub fn lookup(&self, id: CellId) -> Result<&Arc<Metadata>, CoreError> {
        self.get(id).map(RegisteredCell::metadata).ok_or(CoreError::NotRegistered(id))
    }

    /// Registered cell by id
    #[must_use]
    pub fn get(&self, id: CellId) -> Option<&RegisteredCell> {
        self.fixed.get(&id).or_else(|| self.members.get(&id))
    }

    /// Cell currently holding a storage key
    #[must_use]
    pub fn by_storage_key(&self, key: &str) -> Option<&RegisteredCell> {
        self.keys.get(key).and_then(|id| self.get(*id))
    }

    /// Whether a cell is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.fixed.contains_key(&id) || self.members.contains_key(&id)
    }

    /// Metadata of fixed owners only (the view upfixers get at start-up)
    #[must_use]
    pub fn fixed_metadata(&self) -> Vec<Arc<Metadata>> {
        self.fixed.values().map(|entry| Arc::clone(&entry.metadata)).collect()
    }

    /// Number of registered cells
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.fixed.len() + self.members.len()
    }

    /// Whether nothing is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_key(&mut self, entry: &RegisteredCell) {
        self.keys.insert(entry.metadata.storage_key.clone(), entry.cell.id());
        if let Some(listener) = &self.listener {
            entry.cell.attach(listener.clone());
        }
    }

    /// Validate an owner and build entries for its unregistered cells
    fn build(&self, prefix: Option<&str>, owner: &dyn Owner) -> Result<Vec<RegisteredCell>, SchemaError> {
        let owner_name = owner.storage_name();
        if owner_name.is_empty() {
            return Err(SchemaError::EmptyStorageName);
        }
        if is_reserved_key(&owner_name) {
            return Err(SchemaError::ReservedName(owner_name));
        }

        let mut fields = HashSet::new();
        let mut cells = HashSet::new();
        let mut claimed = HashSet::new();
        let mut built = Vec::new();

        for decl in owner.persisted_cells() {
            let field = decl.field();
            if field.is_empty() || field.contains('.') || is_reserved_key(field) {
                return Err(SchemaError::InvalidFieldName {
                    owner: owner_name,
                    field: field.to_string(),
                });
            }
            if !fields.insert(field.to_string()) {
                return Err(SchemaError::DuplicateField {
                    owner: owner_name,
                    field: field.to_string(),
                });
            }
            let id = decl.cell().id();
            if !cells.insert(id) {
                return Err(SchemaError::DuplicateCell {
                    owner: owner_name,
                    field: field.to_string(),
                });
            }
            if self.contains(id) {
                continue;
            }

            let key = storage_key(prefix, &owner_name, field);
            if self.keys.contains_key(&key) || !claimed.insert(key.clone()) {
                return Err(SchemaError::DuplicateStorageKey(key));
            }

            let cell = Arc::clone(decl.cell());
            let default_value = cell.to_raw().map_err(|e| SchemaError::UnserializableDefault {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            if default_value.is_null() && !cell.allows_null() {
                return Err(SchemaError::NullDefault(key));
            }

            let metadata = Metadata {
                owner_name: owner_name.clone(),
                owner_prefix: prefix.map(str::to_string),
                instance_id: owner.instance_id(),
                field_name: field.to_string(),
                type_name: cell.type_name(),
                default_value,
                storage_key: key,
                allows_null: cell.allows_null(),
                i18n_key: decl.i18n_key().map(str::to_string),
            };
            tracing::trace!(key = %metadata.storage_key, type_name = metadata.type_name, "registered cell");
            built.push(RegisteredCell {
                metadata: Arc::new(metadata),
                cell,
            });
        }

        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::PersistedCell;
    use crate::owner::CellSet;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Minimap {
        radius: PersistedCell<u32>,
        title: PersistedCell<Option<String>>,
    }

    impl Minimap {
        fn new() -> Self {
            Self {
                radius: PersistedCell::new(20),
                title: PersistedCell::nullable(None),
            }
        }
    }

    impl Owner for Minimap {
        fn storage_name(&self) -> String {
            "feature.minimap".to_string()
        }

        fn persisted_cells(&self) -> CellSet {
            CellSet::new()
                .cell("radius", &self.radius)
                .cell_with_key("title", &self.title, "minimap.title")
        }
    }

    /// Owner built from an arbitrary name and declaration list
    struct Adhoc {
        name: String,
        cells: CellSet,
    }

    impl Owner for Adhoc {
        fn storage_name(&self) -> String {
            self.name.clone()
        }

        fn persisted_cells(&self) -> CellSet {
            self.cells.clone()
        }
    }

    fn adhoc(name: &str, cells: CellSet) -> Adhoc {
        Adhoc {
            name: name.to_string(),
            cells,
        }
    }

    struct Bar {
        id: u32,
        height: PersistedCell<u32>,
    }

    impl Owner for Bar {
        fn storage_name(&self) -> String {
            format!("bar{}", self.id)
        }

        fn instance_id(&self) -> Option<u32> {
            Some(self.id)
        }

        fn persisted_cells(&self) -> CellSet {
            CellSet::new().cell("height", &self.height)
        }
    }

    #[derive(Default)]
    struct Bars {
        members: Mutex<Vec<Arc<Bar>>>,
        rebuild: bool,
    }

    impl DynamicGroup for Bars {
        fn group_key(&self) -> String {
            "hud.bars".to_string()
        }

        fn member_prefix(&self) -> String {
            "hud".to_string()
        }

        fn default_ids(&self) -> Vec<u32> {
            vec![1]
        }

        fn materialize(&self, ids: &[u32]) -> Result<(), CoreError> {
            let mut members = self.members.lock();
            let mut next = Vec::new();
            for id in ids {
                let existing = members.iter().find(|b| b.id == *id && !self.rebuild).cloned();
                next.push(existing.unwrap_or_else(|| {
                    Arc::new(Bar {
                        id: *id,
                        height: PersistedCell::new(10),
                    })
                }));
            }
            *members = next;
            Ok(())
        }

        fn members(&self) -> Vec<Arc<dyn Owner>> {
            self.members.lock().iter().map(|b| Arc::clone(b) as Arc<dyn Owner>).collect()
        }

        fn instance_ids(&self) -> Vec<u32> {
            self.members.lock().iter().map(|b| b.id).collect()
        }
    }

    #[test]
    fn register_builds_metadata() {
        let owner = Minimap::new();
        let mut registry = MetadataRegistry::new();

        assert_eq!(registry.register(&owner).unwrap(), 2);

        let meta = registry.lookup(owner.radius.id()).unwrap();
        assert_eq!(meta.storage_key(), "feature.minimap.radius");
        assert_eq!(meta.default_value(), &json!(20));
        assert_eq!(meta.type_name(), "u32");
        assert!(!meta.allows_null());
        assert_eq!(meta.i18n_key(), "feature.minimap.radius");

        let title = registry.lookup(owner.title.id()).unwrap();
        assert!(title.allows_null());
        assert_eq!(title.i18n_key(), "minimap.title");
    }

    #[test]
    fn register_twice_is_a_no_op() {
        let owner = Minimap::new();
        let mut registry = MetadataRegistry::new();
        registry.register(&owner).unwrap();
        assert_eq!(registry.register(&owner).unwrap(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn default_is_captured_at_registration() {
        let owner = Minimap::new();
        let mut registry = MetadataRegistry::new();
        registry.register(&owner).unwrap();

        owner.radius.set(99);

        let entry = registry.get(owner.radius.id()).unwrap();
        assert_eq!(entry.metadata().default_value(), &json!(20));
        assert!(entry.value_changed().unwrap());
        entry.reset().unwrap();
        assert_eq!(owner.radius.get(), 20);
        assert!(!entry.value_changed().unwrap());
    }

    #[test]
    fn lookup_before_register_fails() {
        let registry = MetadataRegistry::new();
        let cell = PersistedCell::new(1);
        assert!(matches!(registry.lookup(cell.id()), Err(CoreError::NotRegistered(_))));
    }

    #[test]
    fn null_default_requires_nullable() {
        let cell = PersistedCell::new(None::<u8>);
        let owner = adhoc("feature.a", CellSet::new().cell("x", &cell));
        let err = MetadataRegistry::new().register(&owner).unwrap_err();
        assert_eq!(err, SchemaError::NullDefault("feature.a.x".to_string()));
    }

    #[test]
    fn malformed_declarations_are_rejected() {
        let a = PersistedCell::new(1);
        let b = PersistedCell::new(2);

        let cases = vec![
            (adhoc("", CellSet::new().cell("x", &a)), "empty name"),
            (adhoc("$feature", CellSet::new().cell("x", &a)), "reserved name"),
            (adhoc("f", CellSet::new().cell("x.y", &a)), "dotted field"),
            (adhoc("f", CellSet::new().cell("", &a)), "empty field"),
            (adhoc("f", CellSet::new().cell("x", &a).cell("x", &b)), "duplicate field"),
            (adhoc("f", CellSet::new().cell("x", &a).cell("y", &a)), "duplicate cell"),
        ];

        for (owner, label) in cases {
            let mut registry = MetadataRegistry::new();
            assert!(registry.register(&owner).is_err(), "{label} accepted");
            assert!(registry.is_empty(), "{label} left partial state");
        }
    }

    #[test]
    fn storage_keys_are_unique() {
        let a = PersistedCell::new(1);
        let b = PersistedCell::new(2);
        let mut registry = MetadataRegistry::new();

        registry.register(&adhoc("f", CellSet::new().cell("x", &a))).unwrap();
        let err = registry.register(&adhoc("f", CellSet::new().cell("x", &b))).unwrap_err();

        assert_eq!(err, SchemaError::DuplicateStorageKey("f.x".to_string()));
        assert_eq!(registry.by_storage_key("f.x").map(|e| e.cell().id()), Some(a.id()));
    }

    #[test]
    fn members_follow_live_groups() {
        let bars = Arc::new(Bars::default());
        let groups: Vec<Arc<dyn DynamicGroup>> = vec![bars.clone()];
        let mut registry = MetadataRegistry::new();

        bars.materialize(&[1, 3]).unwrap();
        let all = registry.all_metadata(&groups).unwrap();
        let keys: Vec<_> = all.iter().map(|e| e.metadata().storage_key().to_string()).collect();
        assert_eq!(keys, vec!["hud.bar1.height", "hud.bar3.height"]);
        assert_eq!(all[1].metadata().instance_id(), Some(3));

        bars.materialize(&[3, 5]).unwrap();
        let fresh = registry.refresh_members(&groups).unwrap();
        assert_eq!(fresh.len(), 1);

        let all = registry.all_metadata(&groups).unwrap();
        let keys: Vec<_> = all.iter().map(|e| e.metadata().storage_key().to_string()).collect();
        assert_eq!(keys, vec!["hud.bar3.height", "hud.bar5.height"]);
        assert!(registry.by_storage_key("hud.bar1.height").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn rebuilt_instances_take_over_their_keys() {
        let bars = Arc::new(Bars {
            rebuild: true,
            ..Bars::default()
        });
        let groups: Vec<Arc<dyn DynamicGroup>> = vec![bars.clone()];
        let mut registry = MetadataRegistry::new();

        bars.materialize(&[1, 3]).unwrap();
        registry.all_metadata(&groups).unwrap();
        let old = registry.by_storage_key("hud.bar1.height").unwrap().cell().id();

        bars.materialize(&[1, 3, 5]).unwrap();
        let fresh = registry.refresh_members(&groups).unwrap();

        assert_eq!(fresh.len(), 3);
        assert_eq!(registry.len(), 3);
        let new = registry.by_storage_key("hud.bar1.height").unwrap().cell().id();
        assert_ne!(old, new);
        assert!(!registry.contains(old));
        assert_eq!(registry.all_metadata(&groups).unwrap().len(), 3);
    }

    #[test]
    fn attaches_listener_on_register() {
        struct Flag(Mutex<Vec<CellId>>);
        impl TouchListener for Flag {
            fn touched(&self, cell: CellId) {
                self.0.lock().push(cell);
            }
        }

        let flag = Arc::new(Flag(Mutex::new(Vec::new())));
        let weak: Weak<Flag> = Arc::downgrade(&flag);
        let mut registry = MetadataRegistry::with_listener(weak);
        let owner = Minimap::new();
        registry.register(&owner).unwrap();

        owner.radius.set(5);

        assert_eq!(*flag.0.lock(), vec![owner.radius.id()]);
    }

    #[test]
    fn storage_key_formats() {
        assert_eq!(storage_key(None, "feature.a", "x"), "feature.a.x");
        assert_eq!(storage_key(Some(""), "feature.a", "x"), "feature.a.x");
        assert_eq!(storage_key(Some("hud"), "bar2", "x"), "hud.bar2.x");
    }
}
