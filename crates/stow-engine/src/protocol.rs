//! Load/save protocol
//!
//! Owns the registry, the registered owners and groups, and the working
//! document. Every step checks the lifecycle table first:
//!
//! 1. [`load_raw`](LoadSaveProtocol::load_raw): take the raw document
//! 2. [`migrate`](LoadSaveProtocol::migrate): run missing upfixers
//! 3. [`materialize_groups`](LoadSaveProtocol::materialize_groups): recreate
//!    recorded group ids (or defaults) and register member cells
//! 4. [`load_values`](LoadSaveProtocol::load_values): populate cells
//!
//! Saves are built from the live metadata and only carry values that differ
//! from their defaults; keys no live cell claims are dropped. No I/O happens
//! here; the engine owns the stores.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use stow_core::{
    is_reserved_key, CellId, DynamicGroup, Metadata, MetadataRegistry, Owner, RegisteredCell, SchemaError,
    StoredDocument, UPFIXERS_KEY,
};
use stow_upfix::{UpfixReport, UpfixerChain};

use crate::error::{EngineError, LifecycleError};
use crate::lifecycle::{validate_transition, DocumentState};

/// Outcome of populating cells from the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Cells assigned from the document
    pub loaded: usize,
    /// Absent cells reset to their default
    pub reset: usize,
    /// Absent cells left as they were
    pub untouched: usize,
    /// Storage keys whose stored value did not fit the declared type
    pub mismatched: Vec<String>,
}

/// Documents and state captured before a reload
#[derive(Debug, Clone)]
pub struct Checkpoint {
    document: StoredDocument,
    source: StoredDocument,
    state: DocumentState,
}

/// Load/save state for one managed document
pub struct LoadSaveProtocol {
    registry: MetadataRegistry,
    owners: Vec<Arc<dyn Owner>>,
    groups: Vec<Arc<dyn DynamicGroup>>,
    failed_groups: HashSet<String>,
    document: StoredDocument,
    source: StoredDocument,
    state: DocumentState,
}

impl std::fmt::Debug for LoadSaveProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSaveProtocol")
            .field("state", &self.state)
            .field("owners", &self.owners.len())
            .field("groups", &self.groups.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl LoadSaveProtocol {
    /// Create protocol around a registry
    #[must_use]
    pub fn new(registry: MetadataRegistry) -> Self {
        Self {
            registry,
            owners: Vec::new(),
            groups: Vec::new(),
            failed_groups: HashSet::new(),
            document: StoredDocument::new(),
            source: StoredDocument::new(),
            state: DocumentState::Unloaded,
        }
    }

    /// Current lifecycle state
    #[inline]
    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Working document (the last loaded or saved one)
    #[inline]
    #[must_use]
    pub fn document(&self) -> &StoredDocument {
        &self.document
    }

    /// Metadata registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// Registered dynamic groups
    #[inline]
    #[must_use]
    pub fn groups(&self) -> &[Arc<dyn DynamicGroup>] {
        &self.groups
    }

    fn transition(&mut self, to: DocumentState) -> Result<(), LifecycleError> {
        validate_transition(self.state, to)?;
        tracing::trace!(from = ?self.state, to = ?to, "document state");
        self.state = to;
        Ok(())
    }

    /// Register a fixed owner, returning the ids of its new cells
    ///
    /// # Errors
    /// [`SchemaError`] for malformed declarations.
    pub fn register_owner(&mut self, owner: Arc<dyn Owner>) -> Result<Vec<CellId>, SchemaError> {
        let before: HashSet<CellId> = owner
            .persisted_cells()
            .iter()
            .map(|decl| decl.cell().id())
            .filter(|id| self.registry.contains(*id))
            .collect();
        self.registry.register(owner.as_ref())?;

        if !self.owners.iter().any(|known| Arc::ptr_eq(known, &owner)) {
            self.owners.push(Arc::clone(&owner));
        }
        Ok(owner
            .persisted_cells()
            .iter()
            .map(|decl| decl.cell().id())
            .filter(|id| !before.contains(id))
            .collect())
    }

    /// Register a dynamic group
    ///
    /// # Errors
    /// [`SchemaError::DuplicateGroup`] if the group key is taken.
    pub fn register_group(&mut self, group: Arc<dyn DynamicGroup>) -> Result<(), SchemaError> {
        let key = group.group_key();
        if self.groups.iter().any(|known| known.group_key() == key) {
            return Err(SchemaError::DuplicateGroup(key));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Capture the documents and state so a failed reload can be undone
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            document: self.document.clone(),
            source: self.source.clone(),
            state: self.state,
        }
    }

    /// Return to a checkpoint, skipping the transition table
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        tracing::debug!(from = ?self.state, to = ?checkpoint.state, "document state rolled back");
        self.document = checkpoint.document;
        self.source = checkpoint.source;
        self.state = checkpoint.state;
    }

    /// Take a freshly read raw document
    ///
    /// # Errors
    /// [`LifecycleError::IllegalTransition`] unless unloaded or fully loaded.
    pub fn load_raw(&mut self, document: StoredDocument) -> Result<(), LifecycleError> {
        self.transition(DocumentState::RawLoaded)?;
        self.document = document;
        Ok(())
    }

    /// Run every upfixer the document has not recorded yet
    ///
    /// Upfixers see the metadata of fixed owners; group members do not exist
    /// until the groups are materialized.
    ///
    /// # Errors
    /// [`LifecycleError::IllegalTransition`] unless the raw document is loaded.
    pub fn migrate(&mut self, chain: &UpfixerChain) -> Result<UpfixReport, LifecycleError> {
        self.transition(DocumentState::Migrated)?;
        let cells = self.registry.fixed_metadata();
        let report = chain.run(&mut self.document, &cells);
        self.source = self.document.clone();
        Ok(report)
    }

    /// Recreate every group from its recorded ids, or its defaults
    ///
    /// A group that fails to materialize is logged and skipped. Its recorded
    /// ids and member values are carried over unchanged by later saves.
    ///
    /// # Errors
    /// Lifecycle violations and [`SchemaError`]s from new member cells.
    pub fn materialize_groups(&mut self) -> Result<(), EngineError> {
        self.transition(DocumentState::GroupsMaterialized)?;

        for group in &self.groups {
            let key = group.group_key();
            let ids = self.document.group_ids(&key).unwrap_or_else(|| group.default_ids());
            match group.materialize(&ids) {
                Ok(()) => {
                    group.enable_members();
                    self.failed_groups.remove(&key);
                    tracing::debug!(group = %key, ids = ?ids, "group materialized");
                }
                Err(error) => {
                    tracing::warn!(group = %key, %error, "group failed to materialize, skipping");
                    self.failed_groups.insert(key);
                }
            }
        }

        self.registry.refresh_members(&self.groups)?;
        Ok(())
    }

    /// Keep the current group instances (reload path)
    ///
    /// # Errors
    /// [`LifecycleError::IllegalTransition`] unless migrated.
    pub fn keep_groups(&mut self) -> Result<(), EngineError> {
        self.transition(DocumentState::GroupsMaterialized)?;
        self.registry.refresh_members(&self.groups)?;
        Ok(())
    }

    /// Populate every registered cell from the document
    ///
    /// Absent keys are reset to their default when `reset_missing` is set
    /// and left untouched otherwise.
    ///
    /// # Errors
    /// Lifecycle violations and [`SchemaError`]s from new member cells.
    pub fn load_values(&mut self, reset_missing: bool) -> Result<LoadReport, EngineError> {
        self.transition(DocumentState::ValuesLoaded)?;
        let cells = self.registry.all_metadata(&self.groups)?;
        Ok(apply_document(&self.document, &cells, reset_missing))
    }

    /// Populate the given cells only (late registration)
    ///
    /// Values come from the document as it was last loaded, so keys of
    /// owners registered late are found even after saves dropped them.
    ///
    /// # Errors
    /// [`LifecycleError::NotInitialized`] before the first load.
    pub fn load_cells(&mut self, ids: &[CellId], reset_missing: bool) -> Result<LoadReport, EngineError> {
        if !self.state.is_loaded() {
            return Err(LifecycleError::NotInitialized.into());
        }
        let cells: Vec<RegisteredCell> = ids.iter().filter_map(|id| self.registry.get(*id).cloned()).collect();
        Ok(apply_document(&self.source, &cells, reset_missing))
    }

    /// Owners whose load hook runs after a full load
    #[must_use]
    pub fn hook_targets(&self) -> Vec<Arc<dyn Owner>> {
        let mut targets = self.owners.clone();
        for group in &self.groups {
            targets.extend(group.members());
        }
        targets
    }

    /// Recreate one group with `ids` and load only the cells that are new
    ///
    /// Returns the load report and the newly created members. Nothing is
    /// written; the caller decides when to save.
    ///
    /// # Errors
    /// [`EngineError::UnknownGroup`], lifecycle violations, the group's own
    /// materialize error, or [`SchemaError`]s from new member cells.
    pub fn materialize_and_load_group(
        &mut self,
        group_key: &str,
        ids: &[u32],
    ) -> Result<(LoadReport, Vec<Arc<dyn Owner>>), EngineError> {
        let group = self
            .groups
            .iter()
            .find(|group| group.group_key() == group_key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownGroup(group_key.to_string()))?;

        self.transition(DocumentState::GroupsMaterialized)?;
        let previous: HashSet<u32> = group.instance_ids().into_iter().collect();

        let materialized = group.materialize(ids);
        if materialized.is_ok() {
            group.enable_members();
            self.failed_groups.remove(group_key);
        }
        let fresh = self.registry.refresh_members(&self.groups);
        self.transition(DocumentState::ValuesLoaded)?;
        materialized?;
        let fresh = fresh?;

        let cells: Vec<RegisteredCell> = fresh.iter().filter_map(|id| self.registry.get(*id).cloned()).collect();
        let report = apply_document(&self.document, &cells, true);

        let created = group
            .members()
            .into_iter()
            .filter(|member| member.instance_id().map_or(true, |id| !previous.contains(&id)))
            .collect();

        tracing::info!(group = group_key, ids = ?ids, new_cells = fresh.len(), "group resized");
        Ok((report, created))
    }

    /// Build the changed-only document to write
    ///
    /// # Errors
    /// [`LifecycleError::NotInitialized`] before values are loaded, or
    /// [`SchemaError`]s from new member cells.
    pub fn build_save_document(&mut self) -> Result<StoredDocument, EngineError> {
        if !self.state.is_loaded() {
            return Err(LifecycleError::NotInitialized.into());
        }

        let cells = self.registry.all_metadata(&self.groups)?;
        let mut document = StoredDocument::new();

        if let Some(applied) = self.document.get(UPFIXERS_KEY) {
            document.insert(UPFIXERS_KEY, applied.clone());
        }

        // members of a group that failed to materialize keep their stored values
        let parked: Vec<String> = self
            .groups
            .iter()
            .filter(|group| self.failed_groups.contains(&group.group_key()))
            .map(|group| format!("{}.", group.member_prefix()))
            .collect();
        if !parked.is_empty() {
            for (key, value) in self.document.as_map() {
                if !is_reserved_key(key) && parked.iter().any(|prefix| key.starts_with(prefix.as_str())) {
                    document.insert(key.clone(), value.clone());
                }
            }
        }

        for entry in &cells {
            let meta = entry.metadata();
            match entry.cell().to_raw() {
                Ok(raw) if raw != *meta.default_value() => {
                    document.insert(meta.storage_key(), raw);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(key = meta.storage_key(), %error, "value cannot be serialized, keeping stored copy");
                    if let Some(previous) = self.document.get(meta.storage_key()) {
                        document.insert(meta.storage_key(), previous.clone());
                    }
                }
            }
        }

        if !self.groups.is_empty() {
            let groups: BTreeMap<String, Vec<u32>> = self
                .groups
                .iter()
                .map(|group| {
                    let key = group.group_key();
                    let ids = if self.failed_groups.contains(&key) {
                        self.document.group_ids(&key).unwrap_or_default()
                    } else {
                        group.instance_ids()
                    };
                    (key, ids)
                })
                .collect();
            document.set_groups(&groups);
        }

        Ok(document)
    }

    /// Adopt a successfully written document as the working document
    pub fn commit_saved(&mut self, document: StoredDocument) {
        self.document = document;
    }

    /// Build the document holding every cell's default value
    ///
    /// # Errors
    /// [`SchemaError`]s from new member cells.
    pub fn build_defaults_document(&mut self) -> Result<StoredDocument, EngineError> {
        let cells = self.registry.all_metadata(&self.groups)?;
        let mut document = StoredDocument::new();
        for entry in &cells {
            let meta = entry.metadata();
            document.insert(meta.storage_key(), meta.default_value().clone());
        }
        Ok(document)
    }

    /// Live metadata of every registered cell
    ///
    /// # Errors
    /// [`SchemaError`]s from new member cells.
    pub fn all_metadata(&mut self) -> Result<Vec<Arc<Metadata>>, EngineError> {
        let cells = self.registry.all_metadata(&self.groups)?;
        Ok(cells.iter().map(|entry| Arc::clone(entry.metadata())).collect())
    }

    /// Registered cell by id
    #[must_use]
    pub fn cell(&self, id: CellId) -> Option<&RegisteredCell> {
        self.registry.get(id)
    }
}

fn apply_document(document: &StoredDocument, cells: &[RegisteredCell], reset_missing: bool) -> LoadReport {
    let mut report = LoadReport::default();

    for entry in cells {
        let key = entry.metadata().storage_key();
        match document.get(key) {
            Some(raw) => match entry.cell().restore_raw(raw.clone()) {
                Ok(()) => report.loaded += 1,
                Err(error) => {
                    tracing::warn!(key, %error, "stored value does not fit, keeping current value");
                    report.mismatched.push(key.to_string());
                }
            },
            None if reset_missing => match entry.reset() {
                Ok(()) => report.reset += 1,
                Err(error) => tracing::warn!(key, %error, "failed to reset value"),
            },
            None => report.untouched += 1,
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stow_core::{CellSet, PersistedCell};

    struct Minimap {
        radius: PersistedCell<u32>,
        label: PersistedCell<String>,
    }

    impl Owner for Minimap {
        fn storage_name(&self) -> String {
            "feature.minimap".to_string()
        }

        fn persisted_cells(&self) -> CellSet {
            CellSet::new().cell("radius", &self.radius).cell("label", &self.label)
        }
    }

    fn minimap() -> Arc<Minimap> {
        Arc::new(Minimap {
            radius: PersistedCell::new(20),
            label: PersistedCell::new("map".to_string()),
        })
    }

    fn loaded(owner: &Arc<Minimap>, document: serde_json::Value, reset: bool) -> (LoadSaveProtocol, LoadReport) {
        let mut protocol = LoadSaveProtocol::new(MetadataRegistry::new());
        protocol.register_owner(owner.clone()).unwrap();
        protocol.load_raw(serde_json::from_value(document).unwrap()).unwrap();
        protocol.migrate(&UpfixerChain::new()).unwrap();
        protocol.materialize_groups().unwrap();
        let report = protocol.load_values(reset).unwrap();
        (protocol, report)
    }

    #[test]
    fn steps_must_run_in_order() {
        let mut protocol = LoadSaveProtocol::new(MetadataRegistry::new());
        assert!(protocol.load_values(true).is_err());
        assert!(protocol.build_save_document().is_err());
        protocol.load_raw(StoredDocument::new()).unwrap();
        assert!(protocol.materialize_groups().is_err());
    }

    #[test]
    fn present_values_load_and_absent_reset() {
        let owner = minimap();
        owner.label.set("dirty".to_string());

        let (_, report) = loaded(&owner, json!({"feature.minimap.radius": 35}), true);

        assert_eq!(owner.radius.get(), 35);
        assert_eq!(owner.label.get(), "map");
        assert_eq!(report.loaded, 1);
        assert_eq!(report.reset, 1);
    }

    #[test]
    fn absent_values_can_be_left_alone() {
        let owner = minimap();
        let (mut protocol, _) = loaded(&owner, json!({}), true);
        owner.label.set("edited".to_string());

        protocol.load_raw(StoredDocument::new()).unwrap();
        protocol.migrate(&UpfixerChain::new()).unwrap();
        protocol.keep_groups().unwrap();
        let report = protocol.load_values(false).unwrap();

        assert_eq!(owner.label.get(), "edited");
        assert_eq!(report.untouched, 2);
    }

    #[test]
    fn rollback_restores_document_and_state() {
        let owner = minimap();
        let (mut protocol, _) = loaded(&owner, json!({"feature.minimap.radius": 35}), true);
        let checkpoint = protocol.checkpoint();

        let next = json!({"feature.minimap.radius": 50, "feature.later.size": 9});
        protocol.load_raw(serde_json::from_value(next).unwrap()).unwrap();
        protocol.migrate(&UpfixerChain::new()).unwrap();
        assert_eq!(protocol.state(), DocumentState::Migrated);

        protocol.rollback(checkpoint);

        assert_eq!(protocol.state(), DocumentState::ValuesLoaded);
        assert_eq!(protocol.document().get("feature.minimap.radius"), Some(&json!(35)));
        assert!(protocol.build_save_document().is_ok());

        let later = Arc::new(Later {
            size: PersistedCell::new(1),
        });
        let fresh = protocol.register_owner(later.clone()).unwrap();
        assert_eq!(protocol.load_cells(&fresh, true).unwrap().reset, 1);
        assert_eq!(later.size.get(), 1);
    }

    #[test]
    fn mismatched_value_keeps_current() {
        let owner = minimap();
        let (_, report) = loaded(&owner, json!({"feature.minimap.radius": "wide"}), true);

        assert_eq!(owner.radius.get(), 20);
        assert_eq!(report.mismatched, vec!["feature.minimap.radius"]);
    }

    #[test]
    fn save_holds_changed_values_only() {
        let owner = minimap();
        let (mut protocol, _) = loaded(
            &owner,
            json!({"$upfixers": ["a"], "feature.minimap.label": "map", "feature.later.x": 1}),
            true,
        );
        owner.radius.set(42);

        let saved = protocol.build_save_document().unwrap();

        assert_eq!(
            saved,
            serde_json::from_value::<StoredDocument>(json!({
                "$upfixers": ["a"],
                "feature.minimap.radius": 42,
            }))
            .unwrap()
        );
    }

    struct Later {
        size: PersistedCell<u32>,
    }

    impl Owner for Later {
        fn storage_name(&self) -> String {
            "feature.later".to_string()
        }

        fn persisted_cells(&self) -> CellSet {
            CellSet::new().cell("size", &self.size)
        }
    }

    #[test]
    fn late_cells_load_from_the_document_as_loaded() {
        let owner = minimap();
        let (mut protocol, _) = loaded(&owner, json!({"feature.later.size": 9}), true);
        let saved = protocol.build_save_document().unwrap();
        assert!(!saved.contains_key("feature.later.size"));
        protocol.commit_saved(saved);

        let later = Arc::new(Later {
            size: PersistedCell::new(1),
        });
        let fresh = protocol.register_owner(later.clone()).unwrap();
        let report = protocol.load_cells(&fresh, true).unwrap();

        assert_eq!(later.size.get(), 9);
        assert_eq!(report.loaded, 1);
    }

    #[test]
    fn value_equal_to_default_is_not_saved() {
        let owner = minimap();
        let (mut protocol, _) = loaded(&owner, json!({"feature.minimap.radius": 42}), true);
        owner.radius.set(20);

        assert!(protocol.build_save_document().unwrap().is_empty());
    }

    #[test]
    fn defaults_document_lists_every_cell() {
        let owner = minimap();
        let (mut protocol, _) = loaded(&owner, json!({"feature.minimap.radius": 42}), true);

        let defaults = protocol.build_defaults_document().unwrap();

        assert_eq!(defaults.get("feature.minimap.radius"), Some(&json!(20)));
        assert_eq!(defaults.get("feature.minimap.label"), Some(&json!("map")));
        assert_eq!(defaults.value_count(), 2);
    }

    #[test]
    fn late_owner_registration_reports_new_cells() {
        let owner = minimap();
        let mut protocol = LoadSaveProtocol::new(MetadataRegistry::new());
        assert_eq!(protocol.register_owner(owner.clone()).unwrap().len(), 2);
        assert!(protocol.register_owner(owner).unwrap().is_empty());
        assert_eq!(protocol.hook_targets().len(), 1);
    }
}
