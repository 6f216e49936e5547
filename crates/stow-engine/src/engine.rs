//! Persistence engine
//!
//! Ties the protocol to its stores and the write scheduler. The host builds
//! one engine per managed document, registers owners and groups, calls
//! [`PersistenceEngine::init`] once, and [`PersistenceEngine::shutdown`] on
//! exit. In between, every [`PersistedCell::set`] eventually lands on disk.
//!
//! Locking: the write lock serializes every store write; the protocol lock
//! is never held across I/O or owner callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use stow_core::{
    from_raw, CellId, CoreError, DynamicGroup, Metadata, MetadataRegistry, Owner, PersistValue, PersistedCell,
    RegisteredCell, StoredDocument,
};
use stow_upfix::{UpfixReport, UpfixerChain};
use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, LifecycleError};
use crate::lifecycle::DocumentState;
use crate::protocol::{LoadReport, LoadSaveProtocol};
use crate::scheduler::{PersistScheduler, PersistSink};
use crate::storage::{DocumentStore, FileStore};

/// Outcome of [`PersistenceEngine::init`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Upfixer chain outcome
    pub upfix: UpfixReport,
    /// Whether the migrated document was written before loading
    pub forced_write: bool,
    /// Value load outcome
    pub load: LoadReport,
}

/// Builder for [`PersistenceEngine`]
#[derive(Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DocumentStore>>,
    defaults_store: Option<Arc<dyn DocumentStore>>,
    chain: UpfixerChain,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    /// With user document store (defaults to a [`FileStore`] at
    /// [`EngineConfig::user_document_path`])
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// With defaults document store (defaults to a [`FileStore`] at
    /// [`EngineConfig::defaults_document_path`])
    #[must_use]
    pub fn defaults_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.defaults_store = Some(store);
        self
    }

    /// With upfixer chain
    #[must_use]
    pub fn upfixers(mut self, chain: UpfixerChain) -> Self {
        self.chain = chain;
        self
    }

    /// With runtime for background writes (defaults to the current one)
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    /// [`EngineError::Config`] for an invalid config, [`EngineError::NoRuntime`]
    /// outside a tokio runtime without an explicit handle.
    pub fn build(self) -> EngineResult<PersistenceEngine> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| EngineError::NoRuntime)?,
        };

        let store: Arc<dyn DocumentStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::new(self.config.user_document_path())),
        };
        let defaults_store: Arc<dyn DocumentStore> = match self.defaults_store {
            Some(store) => store,
            None => Arc::new(FileStore::new(self.config.defaults_document_path())),
        };
        let interval = self.config.min_save_interval();
        let config = self.config;
        let chain = self.chain;

        let inner = Arc::new_cyclic(|me: &Weak<EngineInner>| {
            let sink: Weak<dyn PersistSink> = me.clone();
            let scheduler = PersistScheduler::new(interval, runtime, sink);
            let registry = MetadataRegistry::with_listener(scheduler.listener());
            EngineInner {
                config,
                store,
                defaults_store,
                chain,
                protocol: Mutex::new(LoadSaveProtocol::new(registry)),
                write_lock: Mutex::new(()),
                scheduler,
                shut_down: AtomicBool::new(false),
            }
        });

        tracing::debug!(store = %inner.store.describe(), "persistence engine built");
        Ok(PersistenceEngine { inner })
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    defaults_store: Arc<dyn DocumentStore>,
    chain: UpfixerChain,
    protocol: Mutex<LoadSaveProtocol>,
    write_lock: Mutex<()>,
    scheduler: PersistScheduler,
    shut_down: AtomicBool,
}

impl EngineInner {
    /// Changed-only save of the live state
    fn save(&self) -> EngineResult<()> {
        let _write = self.write_lock.lock();
        let document = self.protocol.lock().build_save_document()?;
        self.store.save(&document)?;
        tracing::info!(
            target_store = %self.store.describe(),
            values = document.value_count(),
            "settings saved"
        );
        self.protocol.lock().commit_saved(document);
        Ok(())
    }

    /// Write the working document as-is (after a migration)
    fn write_working_document(&self) -> EngineResult<()> {
        let _write = self.write_lock.lock();
        let document = self.protocol.lock().document().clone();
        self.store.save(&document)?;
        self.scheduler.note_forced_write();
        tracing::info!(target_store = %self.store.describe(), "migrated document written");
        Ok(())
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn registered(&self, id: CellId) -> EngineResult<RegisteredCell> {
        let protocol = self.protocol.lock();
        let entry = protocol.cell(id).cloned();
        entry.ok_or_else(|| CoreError::NotRegistered(id).into())
    }
}

impl PersistSink for EngineInner {
    fn persist(&self) -> EngineResult<()> {
        self.save()
    }
}

/// Persistence engine for one managed document
#[derive(Clone)]
pub struct PersistenceEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PersistenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEngine")
            .field("store", &self.inner.store.describe())
            .field("state", &self.state())
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

impl PersistenceEngine {
    /// Start building an engine
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            defaults_store: None,
            chain: UpfixerChain::new(),
            runtime: None,
        }
    }

    /// Engine configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Write scheduler
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &PersistScheduler {
        &self.inner.scheduler
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.inner.protocol.lock().state()
    }

    /// Copy of the working document
    #[must_use]
    pub fn document(&self) -> StoredDocument {
        self.inner.protocol.lock().document().clone()
    }

    /// Register a fixed owner
    ///
    /// Owners registered after [`init`](Self::init) are loaded immediately
    /// from the document as last read from storage.
    ///
    /// # Errors
    /// [`EngineError::Schema`] for malformed declarations.
    pub fn register_owner(&self, owner: Arc<dyn Owner>) -> EngineResult<()> {
        self.inner.ensure_open()?;
        let late = {
            let mut protocol = self.inner.protocol.lock();
            let fresh = protocol.register_owner(Arc::clone(&owner))?;
            if protocol.state().is_loaded() && !fresh.is_empty() {
                Some(protocol.load_cells(&fresh, true)?)
            } else {
                None
            }
        };
        if let Some(report) = late {
            tracing::debug!(owner = %owner.storage_name(), loaded = report.loaded, "late owner loaded");
            owner.on_persisted_load();
        }
        Ok(())
    }

    /// Register a dynamic group; must happen before [`init`](Self::init)
    ///
    /// # Errors
    /// [`EngineError::Schema`] for a duplicate group key,
    /// [`LifecycleError::AlreadyInitialized`] after `init`.
    pub fn register_group(&self, group: Arc<dyn DynamicGroup>) -> EngineResult<()> {
        let mut protocol = self.inner.protocol.lock();
        if protocol.state() != DocumentState::Unloaded {
            return Err(LifecycleError::AlreadyInitialized.into());
        }
        protocol.register_group(group)?;
        Ok(())
    }

    /// Load, migrate, materialize, populate, save, export
    ///
    /// Storage failures after the document was read are logged, not
    /// returned; in-memory state stays authoritative.
    ///
    /// # Errors
    /// [`LifecycleError::AlreadyInitialized`], read failures of the user
    /// document, and schema violations of group members.
    pub fn init(&self) -> EngineResult<InitReport> {
        self.inner.ensure_open()?;
        if self.state() != DocumentState::Unloaded {
            return Err(LifecycleError::AlreadyInitialized.into());
        }

        let raw = self.inner.store.load()?;
        let upfix = {
            let mut protocol = self.inner.protocol.lock();
            protocol.load_raw(raw)?;
            protocol.migrate(&self.inner.chain)?
        };

        let mut forced_write = false;
        if upfix.changed {
            match self.inner.write_working_document() {
                Ok(()) => forced_write = true,
                Err(error) => tracing::warn!(%error, "failed to write migrated document"),
            }
        }

        let (load, targets) = {
            let mut protocol = self.inner.protocol.lock();
            protocol.materialize_groups()?;
            let load = protocol.load_values(true)?;
            (load, protocol.hook_targets())
        };
        for owner in targets {
            owner.on_persisted_load();
        }

        if let Err(error) = self.save_now() {
            tracing::warn!(%error, "initial save failed");
        }
        self.inner.scheduler.mark_initialized();

        if self.inner.config.export_defaults {
            if let Err(error) = self.export_defaults() {
                tracing::warn!(%error, "failed to export defaults");
            }
        }

        tracing::info!(
            loaded = load.loaded,
            reset = load.reset,
            upfixers = upfix.applied.len(),
            "settings initialized"
        );
        Ok(InitReport {
            upfix,
            forced_write,
            load,
        })
    }

    /// Metadata of a cell
    ///
    /// # Errors
    /// [`CoreError::NotRegistered`].
    pub fn metadata<T: PersistValue>(&self, cell: &PersistedCell<T>) -> EngineResult<Arc<Metadata>> {
        Ok(Arc::clone(self.inner.registered(cell.id())?.metadata()))
    }

    /// Whether a cell holds a user override (differs from its default)
    ///
    /// # Errors
    /// Lookup or serialization failures.
    pub fn value_changed<T: PersistValue>(&self, cell: &PersistedCell<T>) -> EngineResult<bool> {
        Ok(self.inner.registered(cell.id())?.value_changed()?)
    }

    /// Default value of a cell
    ///
    /// # Errors
    /// Lookup failures.
    pub fn default_value<T: PersistValue>(&self, cell: &PersistedCell<T>) -> EngineResult<T> {
        let entry = self.inner.registered(cell.id())?;
        Ok(from_raw(entry.metadata().default_value().clone())?)
    }

    /// Restore a cell's default and schedule a save
    ///
    /// # Errors
    /// Lookup failures.
    pub fn reset<T: PersistValue>(&self, cell: &PersistedCell<T>) -> EngineResult<()> {
        let entry = self.inner.registered(cell.id())?;
        entry.reset()?;
        entry.cell().notify();
        Ok(())
    }

    /// Assign a raw value without scheduling a save
    ///
    /// # Errors
    /// Lookup failures and values that do not fit the declared type.
    pub fn restore_value<T: PersistValue>(&self, cell: &PersistedCell<T>, raw: Value) -> EngineResult<()> {
        let entry = self.inner.registered(cell.id())?;
        entry.cell().restore_raw(raw)?;
        Ok(())
    }

    /// Live metadata of every cell, group members included
    ///
    /// # Errors
    /// Schema violations of new group members.
    pub fn all_metadata(&self) -> EngineResult<Vec<Arc<Metadata>>> {
        self.inner.protocol.lock().all_metadata()
    }

    /// Re-read the document and load it, leaving absent values untouched
    ///
    /// Group instances are kept as they are. On failure the previous
    /// document and state are restored.
    ///
    /// # Errors
    /// [`LifecycleError::NotInitialized`] before `init`, read failures,
    /// [`SchemaError`](stow_core::SchemaError)s from changed group members.
    pub fn reload(&self) -> EngineResult<LoadReport> {
        self.inner.ensure_open()?;
        if !self.state().is_loaded() {
            return Err(LifecycleError::NotInitialized.into());
        }

        let (load, targets, migrated) = {
            let _write = self.inner.write_lock.lock();
            let raw = self.inner.store.load()?;
            let mut protocol = self.inner.protocol.lock();
            let checkpoint = protocol.checkpoint();
            match reload_document(&mut protocol, raw, &self.inner.chain) {
                Ok((load, migrated)) => (load, protocol.hook_targets(), migrated),
                Err(error) => {
                    tracing::warn!(%error, "reload failed, keeping the previous document");
                    protocol.rollback(checkpoint);
                    return Err(error);
                }
            }
        };

        if migrated {
            if let Err(error) = self.inner.write_working_document() {
                tracing::warn!(%error, "failed to write migrated document");
            }
        }
        for owner in targets {
            owner.on_persisted_load();
        }
        tracing::info!(loaded = load.loaded, untouched = load.untouched, "settings reloaded");
        Ok(load)
    }

    /// Recreate a group with `ids` and load its new members, without saving
    ///
    /// # Errors
    /// [`EngineError::UnknownGroup`], the group's materialize error,
    /// lifecycle violations.
    pub fn materialize_and_load_group(&self, group_key: &str, ids: &[u32]) -> EngineResult<LoadReport> {
        self.inner.ensure_open()?;
        let (report, created) = self.inner.protocol.lock().materialize_and_load_group(group_key, ids)?;
        for owner in created {
            owner.on_persisted_load();
        }
        Ok(report)
    }

    /// Resize a group and schedule one trailing save
    ///
    /// # Errors
    /// As [`materialize_and_load_group`](Self::materialize_and_load_group).
    pub fn resize_group(&self, group_key: &str, ids: &[u32]) -> EngineResult<LoadReport> {
        let report = self.materialize_and_load_group(group_key, ids)?;
        self.inner.scheduler.touch();
        Ok(report)
    }

    /// Write now, bypassing the scheduler
    ///
    /// # Errors
    /// [`LifecycleError::NotInitialized`] before values are loaded, storage
    /// failures.
    pub fn save_now(&self) -> EngineResult<()> {
        self.inner.save()?;
        self.inner.scheduler.note_forced_write();
        Ok(())
    }

    /// Write every cell's default to the defaults document
    ///
    /// # Errors
    /// Storage failures.
    pub fn export_defaults(&self) -> EngineResult<()> {
        let document = self.inner.protocol.lock().build_defaults_document()?;
        self.inner.defaults_store.save(&document)?;
        tracing::info!(
            target_store = %self.inner.defaults_store.describe(),
            values = document.value_count(),
            "defaults exported"
        );
        Ok(())
    }

    /// Stop scheduling and write synchronously
    ///
    /// Idempotent. An engine that never finished `init` has nothing to write.
    ///
    /// # Errors
    /// Storage failures of the final write.
    pub fn shutdown(&self) -> EngineResult<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.scheduler.close();
        if !self.state().is_loaded() {
            tracing::debug!("shutdown before init, nothing to write");
            return Ok(());
        }
        self.save_now()?;
        tracing::info!("persistence engine shut down");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

/// Load steps of a reload; returns the load report and whether upfixers changed the document
fn reload_document(
    protocol: &mut LoadSaveProtocol,
    raw: StoredDocument,
    chain: &UpfixerChain,
) -> EngineResult<(LoadReport, bool)> {
    protocol.load_raw(raw)?;
    let upfix = protocol.migrate(chain)?;
    protocol.keep_groups()?;
    Ok((protocol.load_values(false)?, upfix.changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use stow_core::CellSet;

    struct Feature {
        radius: PersistedCell<u32>,
    }

    impl Owner for Feature {
        fn storage_name(&self) -> String {
            "feature.minimap".to_string()
        }

        fn persisted_cells(&self) -> CellSet {
            CellSet::new().cell("radius", &self.radius)
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> PersistenceEngine {
        PersistenceEngine::builder(EngineConfig::new().with_export_defaults(false))
            .store(store.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn build_outside_runtime_fails() {
        let err = PersistenceEngine::builder(EngineConfig::new()).build().unwrap_err();
        assert!(matches!(err, EngineError::NoRuntime));
        assert!(err.is_fatal());
    }

    #[test]
    fn build_rejects_invalid_config() {
        let err = PersistenceEngine::builder(EngineConfig::new().with_identity(""))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn lookups_before_registration_fail() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let cell = PersistedCell::new(1_u8);

        assert!(matches!(
            engine.metadata(&cell),
            Err(EngineError::Core(CoreError::NotRegistered(_)))
        ));
    }

    #[tokio::test]
    async fn init_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        engine.init().unwrap();

        assert!(matches!(
            engine.init(),
            Err(EngineError::Lifecycle(LifecycleError::AlreadyInitialized))
        ));
    }

    #[tokio::test]
    async fn owner_api_reports_overrides() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let feature = Arc::new(Feature {
            radius: PersistedCell::new(20),
        });
        engine.register_owner(feature.clone()).unwrap();
        engine.init().unwrap();

        assert!(!engine.value_changed(&feature.radius).unwrap());
        feature.radius.set(30);
        assert!(engine.value_changed(&feature.radius).unwrap());
        assert_eq!(engine.default_value(&feature.radius).unwrap(), 20);

        engine.reset(&feature.radius).unwrap();
        assert_eq!(feature.radius.get(), 20);

        engine.restore_value(&feature.radius, json!(44)).unwrap();
        assert_eq!(feature.radius.get(), 44);
        assert!(engine.restore_value(&feature.radius, json!("x")).is_err());
        assert_eq!(feature.radius.get(), 44);
    }

    #[tokio::test]
    async fn late_owner_is_loaded_from_stored_document() {
        let store = Arc::new(MemoryStore::with_document(
            serde_json::from_value(json!({"feature.minimap.radius": 7})).unwrap(),
        ));
        let engine = engine(&store);
        engine.init().unwrap();

        let feature = Arc::new(Feature {
            radius: PersistedCell::new(20),
        });
        engine.register_owner(feature.clone()).unwrap();

        assert_eq!(feature.radius.get(), 7);
    }

    #[tokio::test]
    async fn shutdown_writes_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let feature = Arc::new(Feature {
            radius: PersistedCell::new(20),
        });
        engine.register_owner(feature.clone()).unwrap();
        engine.init().unwrap();
        let saves = store.save_count();

        feature.radius.set(99);
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();

        assert_eq!(store.save_count(), saves + 1);
        assert_eq!(store.snapshot().get("feature.minimap.radius"), Some(&json!(99)));
        assert!(engine.is_shut_down());
        assert!(matches!(engine.register_owner(feature), Err(EngineError::ShutDown)));
    }
}
