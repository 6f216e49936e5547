//! Stow Engine
//!
//! Persistence engine for owner-declared settings.
//!
//! ## Lifecycle
//!
//! 1. Build with [`PersistenceEngine::builder`]
//! 2. Register owners and dynamic groups
//! 3. [`PersistenceEngine::init`]: load, migrate, materialize groups, load
//!    values, save, export defaults
//! 4. Cell mutations schedule debounced writes
//! 5. [`PersistenceEngine::shutdown`]: final synchronous write
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stow_engine::{EngineConfig, PersistenceEngine};
//!
//! let config = EngineConfig::new()
//!     .with_storage_dir(dirs.config_dir())
//!     .with_identity("player-1");
//!
//! let engine = PersistenceEngine::builder(config)
//!     .upfixers(upfixers())
//!     .build()?;
//!
//! engine.register_owner(minimap.clone())?;
//! engine.register_group(info_boxes.clone())?;
//! engine.init()?;
//!
//! minimap.radius.set(35); // written within the save interval
//!
//! engine.shutdown()?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod scheduler;
pub mod storage;

pub use config::{EngineConfig, DEFAULT_FILE_SUFFIX, DEFAULT_MIN_SAVE_INTERVAL};
pub use engine::{EngineBuilder, InitReport, PersistenceEngine};
pub use error::{ConfigError, EngineError, EngineResult, LifecycleError, StorageError};
pub use lifecycle::{allowed_transitions, validate_transition, DocumentState};
pub use protocol::{Checkpoint, LoadReport, LoadSaveProtocol};
pub use scheduler::{PersistScheduler, PersistSink};
pub use storage::{DocumentStore, FileStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for hosts wiring owners into an engine
pub mod prelude {
    pub use crate::{EngineConfig, EngineError, PersistenceEngine};
    pub use stow_core::{CellSet, DynamicGroup, Owner, PersistedCell};
    pub use stow_upfix::{Upfixer, UpfixerChain};
}
