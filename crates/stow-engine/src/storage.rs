//! Storage targets
//!
//! - [`FileStore`]: one JSON file, written atomically through a temp file in
//!   the same directory. A file that fails to parse is moved aside and read
//!   as empty, so the next save never overwrites the only copy.
//! - [`MemoryStore`]: in-process document for tests and embedders.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use stow_core::StoredDocument;
use tempfile::NamedTempFile;

use crate::error::StorageError;

/// Where a document lives
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Read the document; a missing document reads as empty
    ///
    /// # Errors
    /// [`StorageError::Io`] on read failures other than "not found".
    fn load(&self) -> Result<StoredDocument, StorageError>;

    /// Replace the stored document
    ///
    /// # Errors
    /// Any [`StorageError`]; the previous document is left intact.
    fn save(&self, document: &StoredDocument) -> Result<(), StorageError>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Document stored in a single JSON file
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create store for `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn quarantine(&self, reason: &serde_json::Error) -> Result<(), StorageError> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{stamp}"));
        let aside = PathBuf::from(aside);

        fs::rename(&self.path, &aside).map_err(|e| StorageError::io(&self.path, e))?;
        tracing::warn!(
            path = %self.path.display(),
            moved_to = %aside.display(),
            error = %reason,
            "stored document is corrupt, moved aside and starting empty"
        );
        Ok(())
    }
}

impl DocumentStore for FileStore {
    fn load(&self) -> Result<StoredDocument, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no stored document, starting empty");
                return Ok(StoredDocument::new());
            }
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(StoredDocument::new());
        }

        match StoredDocument::from_slice(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                self.quarantine(&e)?;
                Ok(StoredDocument::new())
            }
        }
    }

    fn save(&self, document: &StoredDocument) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StorageError::io(&dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, document).map_err(StorageError::Encode)?;
        tmp.write_all(b"\n").map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.persist(&self.path).map_err(|e| StorageError::io(&self.path, e.error))?;

        tracing::debug!(path = %self.path.display(), values = document.value_count(), "document written");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Document held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoredDocument>,
    saves: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store pre-populated with `document`
    #[must_use]
    pub fn with_document(document: StoredDocument) -> Self {
        Self {
            document: Mutex::new(document),
            ..Self::default()
        }
    }

    /// Number of successful saves
    #[inline]
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Copy of the stored document
    #[must_use]
    pub fn snapshot(&self) -> StoredDocument {
        self.document.lock().clone()
    }

    /// Replace the stored document without counting a save
    pub fn replace(&self, document: StoredDocument) {
        *self.document.lock() = document;
    }

    /// Make subsequent saves fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self) -> Result<StoredDocument, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, document: &StoredDocument) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected(self.describe()));
        }
        *self.document.lock() = document.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
