//! Testing utilities for the Stow workspace
//!
//! Fixture owners, a fixture dynamic group, and upfixers with
//! observable side effects.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stow_core::{CellSet, CoreError, DynamicGroup, Metadata, Owner, PersistedCell, StoredDocument};
use stow_upfix::{UpfixError, Upfixer};

/// Parse a JSON literal into a document
pub fn document(value: Value) -> StoredDocument {
    serde_json::from_value(value).expect("fixture document must be a JSON object")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    TopLeft,
    Center,
    BottomRight,
}

/// Fixed owner with one cell of each interesting kind
#[derive(Debug)]
pub struct MinimapFeature {
    pub radius: PersistedCell<u32>,
    pub user_enabled: PersistedCell<bool>,
    pub anchor: PersistedCell<Anchor>,
    pub title: PersistedCell<Option<String>>,
    pub loads: AtomicUsize,
}

impl MinimapFeature {
    pub const NAME: &'static str = "feature.minimap";

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            radius: PersistedCell::new(20),
            user_enabled: PersistedCell::new(true),
            anchor: PersistedCell::new(Anchor::TopLeft),
            title: PersistedCell::nullable(None),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Owner for MinimapFeature {
    fn storage_name(&self) -> String {
        Self::NAME.to_string()
    }

    fn persisted_cells(&self) -> CellSet {
        CellSet::new()
            .cell("radius", &self.radius)
            .cell("userEnabled", &self.user_enabled)
            .cell("anchor", &self.anchor)
            .cell_with_key("title", &self.title, "minimap.title")
    }

    fn on_persisted_load(&self) {
        self.loads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed owner with a single counter cell
#[derive(Debug)]
pub struct CounterFeature {
    pub limit: PersistedCell<u32>,
}

impl CounterFeature {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            limit: PersistedCell::new(20),
        })
    }
}

impl Owner for CounterFeature {
    fn storage_name(&self) -> String {
        "feature.counter".to_string()
    }

    fn persisted_cells(&self) -> CellSet {
        CellSet::new().cell("limit", &self.limit)
    }
}

/// One member of [`InfoBoxGroup`]
#[derive(Debug)]
pub struct InfoBoxOverlay {
    pub id: u32,
    pub height: PersistedCell<u32>,
    pub visible: PersistedCell<bool>,
    pub enabled: AtomicBool,
    pub loads: AtomicUsize,
}

impl InfoBoxOverlay {
    fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            height: PersistedCell::new(100),
            visible: PersistedCell::new(true),
            enabled: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Owner for InfoBoxOverlay {
    fn storage_name(&self) -> String {
        format!("infoBox{}", self.id)
    }

    fn instance_id(&self) -> Option<u32> {
        Some(self.id)
    }

    fn persisted_cells(&self) -> CellSet {
        CellSet::new().cell("height", &self.height).cell("visible", &self.visible)
    }

    fn on_persisted_load(&self) {
        self.loads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dynamic group of info boxes; defaults to ids `[1, 2]`
///
/// With `rebuild_members` set, every materialize replaces all instances,
/// kept ids included.
#[derive(Debug, Default)]
pub struct InfoBoxGroup {
    overlays: Mutex<Vec<Arc<InfoBoxOverlay>>>,
    pub fail_materialize: AtomicBool,
    pub rebuild_members: AtomicBool,
}

impl InfoBoxGroup {
    pub const KEY: &'static str = "overlay.infoBoxes";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn overlay(&self, id: u32) -> Option<Arc<InfoBoxOverlay>> {
        self.overlays.lock().iter().find(|o| o.id == id).cloned()
    }

    pub fn height_key(id: u32) -> String {
        format!("overlay.infoBox{id}.height")
    }
}

impl DynamicGroup for InfoBoxGroup {
    fn group_key(&self) -> String {
        Self::KEY.to_string()
    }

    fn member_prefix(&self) -> String {
        "overlay".to_string()
    }

    fn default_ids(&self) -> Vec<u32> {
        vec![1, 2]
    }

    fn materialize(&self, ids: &[u32]) -> Result<(), CoreError> {
        if self.fail_materialize.load(Ordering::SeqCst) {
            return Err(CoreError::group(Self::KEY, "materialization disabled"));
        }
        let rebuild = self.rebuild_members.load(Ordering::SeqCst);
        let mut overlays = self.overlays.lock();
        let next = ids
            .iter()
            .map(|id| {
                overlays
                    .iter()
                    .find(|o| o.id == *id && !rebuild)
                    .cloned()
                    .unwrap_or_else(|| InfoBoxOverlay::new(*id))
            })
            .collect();
        *overlays = next;
        Ok(())
    }

    fn members(&self) -> Vec<Arc<dyn Owner>> {
        self.overlays
            .lock()
            .iter()
            .map(|o| Arc::clone(o) as Arc<dyn Owner>)
            .collect()
    }

    fn instance_ids(&self) -> Vec<u32> {
        self.overlays.lock().iter().map(|o| o.id).collect()
    }

    fn enable_members(&self) {
        for overlay in self.overlays.lock().iter() {
            overlay.enabled.store(true, Ordering::SeqCst);
        }
    }
}

/// Upfixer that writes `key = true` once and counts its invocations
#[derive(Debug)]
pub struct CountingUpfixer {
    name: String,
    key: Option<String>,
    pub calls: Arc<AtomicUsize>,
}

impl CountingUpfixer {
    /// Upfixer that changes the document
    pub fn changing(name: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            key: Some(key.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Upfixer that succeeds without changing anything
    pub fn noop(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Upfixer for CountingUpfixer {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, document: &mut StoredDocument, _cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.key {
            Some(key) if !document.contains_key(key) => {
                document.insert(key.clone(), Value::Bool(true));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Upfixer that edits the document and then fails
#[derive(Debug)]
pub struct FailingUpfixer(pub &'static str);

impl Upfixer for FailingUpfixer {
    fn name(&self) -> &str {
        self.0
    }

    fn apply(&self, document: &mut StoredDocument, _cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        document.insert("partial.edit.x", Value::Bool(true));
        Err(UpfixError::failed("fixture failure"))
    }
}

/// Upfixer that panics
#[derive(Debug)]
pub struct PanickingUpfixer(pub &'static str);

impl Upfixer for PanickingUpfixer {
    fn name(&self) -> &str {
        self.0
    }

    fn apply(&self, _document: &mut StoredDocument, _cells: &[Arc<Metadata>]) -> Result<bool, UpfixError> {
        panic!("fixture panic");
    }
}
